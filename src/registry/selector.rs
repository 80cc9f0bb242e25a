use crate::config::normalize_label;
use std::fmt;

/// How a caller addresses one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Matches the socks port or the control port.
    Port(u16),
    /// Position in socks-port order, starting at 0.
    Index(usize),
    /// First client (in socks-port order) whose exit labels contain this one.
    Label(String),
}

impl Selector {
    /// Label selector with the label normalized (`{US}` -> `us`).
    pub fn label(raw: &str) -> Self {
        Selector::Label(normalize_label(raw))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Port(port) => write!(f, "port {}", port),
            Selector::Index(index) => write!(f, "index {}", index),
            Selector::Label(label) => write!(f, "label '{}'", label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_constructor_normalizes() {
        assert_eq!(Selector::label("{DE}"), Selector::Label("de".to_string()));
    }

    #[test]
    fn display_names_the_key() {
        assert_eq!(Selector::Port(9050).to_string(), "port 9050");
        assert_eq!(Selector::Index(2).to_string(), "index 2");
        assert_eq!(Selector::label("us").to_string(), "label 'us'");
    }
}
