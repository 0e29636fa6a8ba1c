use colored::Colorize;

fn prefix() -> String {
    "[keto]".bold().cyan().to_string()
}

/// Print an informational message: [keto] message
pub fn info(msg: &str) {
    eprintln!("{} {}", prefix(), msg);
}

/// Print a success message: [keto] message (in green)
pub fn success(msg: &str) {
    eprintln!("{} {}", prefix(), msg.green());
}

/// Print a warning message: [keto] message (in yellow)
pub fn warn(msg: &str) {
    eprintln!("{} {}", prefix(), msg.yellow());
}
