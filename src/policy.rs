//! Body-inclusion policies for trace rendering.

/// Decides whether a record's body is printed verbatim.
///
/// `declared` is the record's `Content-Type` header, if any; `sniffed` is
/// the type detected from the body bytes.
pub trait BodyPolicy {
    fn should_print_body(&self, declared: Option<&str>, sniffed: &str) -> bool;
}

impl<F> BodyPolicy for F
where
    F: Fn(Option<&str>, &str) -> bool,
{
    fn should_print_body(&self, declared: Option<&str>, sniffed: &str) -> bool {
        self(declared, sniffed)
    }
}

/// Prints bodies whose sniffed type looks textual.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextualBodies;

impl TextualBodies {
    const PRINTABLE: [&'static str; 4] = ["text", "html", "json", "xml"];
}

impl BodyPolicy for TextualBodies {
    fn should_print_body(&self, _declared: Option<&str>, sniffed: &str) -> bool {
        Self::PRINTABLE.iter().any(|kind| sniffed.contains(kind))
    }
}
