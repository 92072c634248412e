#![forbid(unsafe_code)]

fn main() {
    std::process::exit(tasklane_cli::run());
}
