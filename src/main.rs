use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    cxr_lens::init_tracing();

    match cxr_lens::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "CxrLens exited with an error");
            ExitCode::FAILURE
        }
    }
}
