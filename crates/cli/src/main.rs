use std::process::ExitCode;

fn main() -> ExitCode {
    gradplan_cli::run()
}
