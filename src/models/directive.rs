use std::fmt;
use std::str::FromStr;

/// Largest edge, in pixels, a resize directive may request.
pub const MAX_DIMENSION: u32 = 10_000;

const RESIZE_PREFIX: &str = "resize:";
const GRAYSCALE: &str = "grayscale";

/// One transformation step, applied in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Resize { width: u32, height: u32 },
    Grayscale,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectiveError {
    #[error("unrecognized directive: {0:?}")]
    Unknown(String),

    #[error("malformed resize directive {0:?} (expected resize:<width>x<height>, 1..={max} px)", max = MAX_DIMENSION)]
    MalformedResize(String),
}

impl FromStr for Directive {
    type Err = DirectiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == GRAYSCALE {
            return Ok(Directive::Grayscale);
        }

        let Some(dimensions) = s.strip_prefix(RESIZE_PREFIX) else {
            return Err(DirectiveError::Unknown(s.to_string()));
        };

        let malformed = || DirectiveError::MalformedResize(s.to_string());
        let (w, h) = dimensions.split_once('x').ok_or_else(malformed)?;
        // Whitespace around either number is tolerated: "resize: 100 x 100"
        let width: u32 = w.trim().parse().map_err(|_| malformed())?;
        let height: u32 = h.trim().parse().map_err(|_| malformed())?;

        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(malformed());
        }

        Ok(Directive::Resize { width, height })
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Resize { width, height } => write!(f, "{RESIZE_PREFIX}{width}x{height}"),
            Directive::Grayscale => f.write_str(GRAYSCALE),
        }
    }
}

/// Parse every entry, failing on the first one that is not a valid directive.
pub fn parse_strict<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Directive>, DirectiveError> {
    raw.iter().map(|s| s.as_ref().parse()).collect()
}

/// Parse every entry, dropping the ones that are not valid directives.
pub fn parse_lenient<S: AsRef<str>>(raw: &[S]) -> Vec<Directive> {
    raw.iter()
        .filter_map(|s| match s.as_ref().parse() {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping directive");
                None
            }
        })
        .collect()
}
