use geneve_cni::commands::{error_result, run_cni};
use tracing::error;

fn main() {
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        // Output error in CNI format
        if error_result(&err).print().is_err() {
            eprintln!("CNI plugin error: {err:#}");
        }
        std::process::exit(1);
    }
}
