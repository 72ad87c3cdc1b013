//! Policy-routing rules steering traffic to and from pods.

use std::sync::Arc;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use tracing::{debug, info};

use crate::netlink::{NetLink, Rule, MAIN_TABLE};

/// Priority of rules matching traffic destined to a pod.
pub const TO_POD_RULE_PRIORITY: u32 = 512;

/// Priority of rules matching traffic sourced from a pod. 1024 is reserved
/// for the "not to VPC, table main" rule installed elsewhere.
pub const FROM_POD_RULE_PRIORITY: u32 = 1536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    /// Match destination = pod address.
    ToPod,
    /// Match source = pod address.
    FromPod,
}

/// One pod-scoped policy rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub direction: RuleDirection,
    pub addr: Ipv4Network,
    /// Extra destination match, only meaningful for [`RuleDirection::FromPod`].
    pub dst: Option<Ipv4Network>,
    pub priority: u32,
    pub table: u32,
}

impl PolicyRule {
    /// `to <addr> lookup main`, priority 512.
    pub fn to_pod(addr: Ipv4Network) -> Self {
        Self {
            direction: RuleDirection::ToPod,
            addr,
            dst: None,
            priority: TO_POD_RULE_PRIORITY,
            table: MAIN_TABLE,
        }
    }

    /// `from <addr> lookup <table>`, priority 1536.
    pub fn from_pod(addr: Ipv4Network, table: u32) -> Self {
        Self {
            direction: RuleDirection::FromPod,
            addr,
            dst: None,
            priority: FROM_POD_RULE_PRIORITY,
            table,
        }
    }

    /// `from <addr> to <cidr> lookup <table>`, priority 1536.
    pub fn from_pod_to(addr: Ipv4Network, cidr: Ipv4Network, table: u32) -> Self {
        Self {
            dst: Some(cidr),
            ..Self::from_pod(addr, table)
        }
    }

    pub fn to_rule(&self) -> Rule {
        match self.direction {
            RuleDirection::ToPod => Rule {
                priority: Some(self.priority),
                src: None,
                dst: Some(self.addr),
                table: Some(self.table),
            },
            RuleDirection::FromPod => Rule {
                priority: Some(self.priority),
                src: Some(self.addr),
                dst: self.dst,
                table: Some(self.table),
            },
        }
    }
}

/// Installs and removes pod policy rules.
pub struct PolicyRoutingManager {
    netlink: Arc<dyn NetLink>,
}

impl PolicyRoutingManager {
    pub fn new(netlink: Arc<dyn NetLink>) -> Self {
        Self { netlink }
    }

    /// Replace any identical rule with a fresh one, so retried attaches
    /// never stack duplicates.
    pub fn add_container_rule(
        &self,
        direction: RuleDirection,
        addr: Ipv4Network,
        priority: u32,
        table: u32,
    ) -> Result<()> {
        let rule = PolicyRule {
            direction,
            addr,
            dst: None,
            priority,
            table,
        }
        .to_rule();

        match self.netlink.rule_del(&rule) {
            Ok(()) => debug!(%rule, "removed pre-existing container rule"),
            Err(e) if e.is_no_such_entry() => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("add NS network: failed to delete old container rule for {addr}")
                });
            }
        }

        self.netlink
            .rule_add(&rule)
            .with_context(|| format!("add NS network: failed to add container rule for {addr}"))?;
        info!(%rule, "added container rule");
        Ok(())
    }

    /// One `from <addr> to <cidr>` rule per VPC CIDR. Each rule is told
    /// apart by its destination, so an identical rule already present is
    /// left in place.
    pub fn add_cidr_rules(&self, addr: Ipv4Network, cidrs: &[Ipv4Network], table: u32) -> Result<()> {
        for cidr in cidrs {
            let rule = PolicyRule::from_pod_to(addr, *cidr, table).to_rule();
            match self.netlink.rule_add(&rule) {
                Ok(()) => info!(%rule, "added pod rule to {}", cidr),
                Err(e) if e.is_exists() => debug!(%rule, "pod rule already present"),
                Err(e) => {
                    return Err(e).context("UpdateRuleListBySrc: failed to add pod rule");
                }
            }
        }
        Ok(())
    }

    /// Remove the `to <addr>` rule at the to-pod priority.
    pub fn remove_to_pod_rule(&self, addr: Ipv4Network) -> Result<()> {
        let rule = Rule {
            priority: Some(TO_POD_RULE_PRIORITY),
            dst: Some(addr),
            ..Rule::default()
        };
        self.netlink
            .rule_del(&rule)
            .with_context(|| format!("failed to delete toContainer rule for {addr}"))
    }

    /// Remove every rule whose source is `addr`, whatever its destination
    /// or table. Returns how many rules were removed.
    pub fn remove_rules_by_source(&self, addr: Ipv4Network) -> Result<usize> {
        let rules = self
            .netlink
            .rule_list()
            .context("DeleteRuleListBySrc: failed to list rules")?;

        let mut removed = 0;
        for rule in rules.into_iter().filter(|r| r.src == Some(addr)) {
            match self.netlink.rule_del(&rule) {
                Ok(()) => {
                    debug!(%rule, "removed pod rule");
                    removed += 1;
                }
                Err(e) if e.is_no_such_entry() => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("DeleteRuleListBySrc: failed to delete rule {rule}")
                    });
                }
            }
        }
        Ok(removed)
    }

    /// All installed rules touching `addr` as source or destination.
    pub fn rules_for(&self, addr: Ipv4Network) -> Result<Vec<Rule>> {
        Ok(self
            .netlink
            .rule_list()
            .context("failed to list rules")?
            .into_iter()
            .filter(|r| r.src == Some(addr) || r.dst == Some(addr))
            .collect())
    }
}
