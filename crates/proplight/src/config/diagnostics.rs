use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

/// Source information for where a diagnostic came from
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub file_path: PathBuf,
    pub content: String,
}

/// A diagnostic message that can be either a warning or an error
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

/// Warning messages that don't prevent config loading
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    EmptyConfig {
        file_path: PathBuf,
    },
    /// A group member with no `[devices]` entry; it stays unavailable.
    UndefinedDevice {
        group: String,
        device_id: String,
        span: Range<usize>,
    },
}

/// Error messages that indicate problems with the config
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Validation(ValidationError),
}

/// Error type for validation failures
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
    pub span: Option<Range<usize>>,
    /// Text attached to the span when rendered.
    pub label: String,
}

impl ValidationError {
    pub fn new(field_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            message: message.into(),
            span: None,
            label: String::new(),
        }
    }

    pub fn at(mut self, span: Range<usize>, label: impl Into<String>) -> Self {
        self.span = Some(span);
        self.label = label.into();
        self
    }
}

impl Diagnostic {
    /// Returns true if this diagnostic is an error
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }

    /// Returns true if this diagnostic is a warning
    pub fn is_warning(&self) -> bool {
        matches!(self, Diagnostic::Warning(_))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Warning(Warning::EmptyConfig { file_path }) => write!(
                f,
                "warning: config file '{}' is empty and has no effect",
                file_path.display()
            ),
            Diagnostic::Warning(Warning::UndefinedDevice {
                group, device_id, ..
            }) => write!(
                f,
                "warning: groups.{}: member '{}' has no device definition",
                group, device_id
            ),
            Diagnostic::Error(Error::Validation(e)) => {
                write!(f, "error: {}: {}", e.field_path, e.message)
            }
        }
    }
}

/// Format all diagnostics for display using Ariadne
pub fn format_diagnostics(diagnostics: &[Diagnostic], source: &SourceInfo) -> String {
    use ariadne::Color;
    use ariadne::Label;
    use ariadne::Report;
    use ariadne::ReportKind;
    use ariadne::Source;

    let file_id = source.file_path.to_string_lossy().to_string();
    let mut output = Vec::new();

    for diagnostic in diagnostics {
        let (kind, message, span, label, color) = match diagnostic {
            Diagnostic::Warning(Warning::EmptyConfig { .. }) => {
                output.extend_from_slice(format!("{}\n", diagnostic).as_bytes());
                continue;
            }
            Diagnostic::Warning(Warning::UndefinedDevice {
                group,
                device_id,
                span,
            }) => (
                ReportKind::Warning,
                format!("Group '{}' member '{}' is not a known device", group, device_id),
                span.clone(),
                "no [devices] entry for this member".to_string(),
                Color::Yellow,
            ),
            Diagnostic::Error(Error::Validation(e)) => match &e.span {
                Some(span) => (
                    ReportKind::Error,
                    format!("Invalid '{}': {}", e.field_path, e.message),
                    span.clone(),
                    e.label.clone(),
                    Color::Red,
                ),
                None => {
                    output.extend_from_slice(format!("{}\n", diagnostic).as_bytes());
                    continue;
                }
            },
        };

        Report::build(kind, (file_id.clone(), span.clone()))
            .with_message(message)
            .with_label(
                Label::new((file_id.clone(), span))
                    .with_message(label)
                    .with_color(color),
            )
            .finish()
            .write((file_id.clone(), Source::from(&source.content)), &mut output)
            .ok();
    }

    String::from_utf8_lossy(&output).to_string()
}
