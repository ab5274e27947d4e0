use std::process::ExitCode;

fn main() -> ExitCode {
    fitout_cli::run()
}
