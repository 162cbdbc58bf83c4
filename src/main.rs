use std::process::ExitCode;

fn main() -> ExitCode {
    match parsleep::cli::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            ExitCode::FAILURE
        }
    }
}
