//! Terminal output helpers.

use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::{OwoColorize, Stream};

static NO_COLOR: AtomicBool = AtomicBool::new(false);

pub fn set_no_color(value: bool) {
    NO_COLOR.store(value, Ordering::SeqCst);
}

fn no_color() -> bool {
    NO_COLOR.load(Ordering::SeqCst)
}

/// Prints an error message with an X mark.
pub fn print_error(msg: &str) {
    if no_color() {
        eprintln!("✗ {msg}");
    } else {
        eprintln!(
            "{} {msg}",
            "✗".if_supports_color(Stream::Stderr, |s| s.red().bold().to_string())
        );
    }
}

/// Prints a header line for a section of output.
pub fn print_header(msg: &str) {
    if no_color() {
        println!("{msg}");
    } else {
        println!("{}", msg.if_supports_color(Stream::Stdout, |s| s.bold().to_string()));
    }
}

/// Prints a labeled key-value pair with indentation.
pub fn print_labeled(key: &str, value: &str) {
    if no_color() {
        println!("  {key}: {value}");
    } else {
        println!(
            "  {}: {value}",
            key.if_supports_color(Stream::Stdout, |s| s.dimmed().to_string())
        );
    }
}
