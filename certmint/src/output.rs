use console::style;

pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

pub fn muted(message: &str) {
    println!("{}", style(message).dim());
}

pub fn error_stderr(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}
