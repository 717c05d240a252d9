// Terminal output for the offload commands
// Status lines go to stderr, plan rows and job output to stdout

const BOLD_CYAN: &str = "1;36";
const BOLD_GREEN: &str = "1;32";
const BOLD_RED: &str = "1;31";
const GREEN: &str = "32";
const YELLOW: &str = "33";
const CYAN: &str = "36";
const RED: &str = "31";

fn styled(code: &str, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", code, text)
}

/// Right-aligned action verb followed by its subject
pub fn status(action: &str, subject: &str) {
    eprintln!("{} {}", styled(BOLD_CYAN, &format!("{:>12}", action)), subject);
}

pub fn success(message: &str) {
    eprintln!("{} {}", styled(BOLD_GREEN, "  \u{2713}"), message);
}

pub fn failure(message: &str) {
    eprintln!("{} {}", styled(BOLD_RED, "  \u{2717}"), message);
}

/// A completed step inside a larger operation
pub fn check(message: &str) {
    eprintln!("{} {}", styled(GREEN, "  \u{2713}"), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", styled(YELLOW, "  !"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", styled(BOLD_RED, "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", styled(CYAN, "  i"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", styled("2", message));
}

/// Section title, e.g. a job state or a plan block
pub fn header(title: &str) {
    eprintln!("{}", styled("1", &format!("==> {}", title)));
}

/// One aligned key/value row of a plan or partition listing
pub fn row(key: &str, value: &str) {
    println!("  {:<24} {}", key, value);
}

/// A line of remote stdout
pub fn job_output(line: &str) {
    println!("        | {}", line);
}

/// A line of remote stderr
pub fn job_error(line: &str) {
    eprintln!("{}", styled(RED, &format!("        | {}", line)));
}
