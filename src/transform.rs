//! Transform suffix parsing: `w100h50r90c10x10+5+5` → ordered conversion steps.
//!
//! ## Grammar
//!
//! The suffix is a run of tokens in any order:
//!
//! | Token | Meaning |
//! |-------|---------|
//! | `w<digits>` | target width |
//! | `h<digits>` | target height |
//! | `r<digits>` | rotation in degrees |
//! | `c<W>x<H>+<X>+<Y>` | crop rectangle |
//!
//! Tokens are stripped from the front, longest match first. Anything left
//! over that no token matches rejects the whole suffix. A repeated token
//! overwrites the earlier one.
//!
//! ## Output order
//!
//! Whatever the input order, the steps come out as
//! `[pre-size] → crop → rotate → resize → strip-metadata`. The pre-size hint
//! (`-size 2Wx2H`) lets the decoder allocate a smaller buffer for big JPEGs;
//! it must precede the input file on the tool's command line, so
//! [`TransformSpec::input_arguments`] returns it separately.

use crate::error::ThumbError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Width,
    Height,
    Rotate,
    Crop,
}

static TOKENS: Lazy<Vec<(TokenKind, Regex)>> = Lazy::new(|| {
    [
        (TokenKind::Width, r"^w(\d+)"),
        (TokenKind::Height, r"^h(\d+)"),
        (TokenKind::Rotate, r"^r(\d+)"),
        (TokenKind::Crop, r"^c(\d+)x(\d+)\+(\d+)\+(\d+)"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// A crop rectangle, `width x height + x_offset + y_offset`.
///
/// Only the shape is checked. Each field is the digit run exactly as it
/// appeared in the URL; bounds and magnitude are the conversion tool's
/// business, so an absurd rectangle fails at conversion, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rect {
    pub width: String,
    pub height: String,
    pub x_offset: String,
    pub y_offset: String,
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.x_offset, self.y_offset
        )
    }
}

/// One step handed to the conversion tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Decode-size hint at double the target dimensions.
    PreSize { width: u32, height: u32 },
    Crop(Rect),
    /// Rotation in degrees as written in the URL, never all zeros.
    Rotate(String),
    /// Either side may be missing; the tool keeps the aspect ratio.
    Resize {
        width: Option<u32>,
        height: Option<u32>,
    },
    /// Drop Exif/IPTC/ICC profiles. Always the last step.
    StripMetadata,
}

impl Operation {
    /// Command-line arguments for this step (ImageMagick syntax).
    pub fn arguments(&self) -> Vec<String> {
        match self {
            Operation::PreSize { width, height } => {
                vec!["-size".into(), format!("{width}x{height}")]
            }
            Operation::Crop(rect) => vec!["-crop".into(), rect.to_string()],
            Operation::Rotate(degrees) => vec!["-rotate".into(), degrees.clone()],
            Operation::Resize { width, height } => vec![
                "-resize".into(),
                format!("{}x{}", dimension(*width), dimension(*height)),
            ],
            Operation::StripMetadata => vec!["+profile".into(), "*".into()],
        }
    }
}

fn dimension(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// The parsed, ordered list of steps for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSpec {
    operations: Vec<Operation>,
}

impl TransformSpec {
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Arguments that must come before the input file (the pre-size hint).
    pub fn input_arguments(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::PreSize { .. }))
            .flat_map(Operation::arguments)
            .collect()
    }

    /// Arguments that go between the input and output files.
    pub fn arguments(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|op| !matches!(op, Operation::PreSize { .. }))
            .flat_map(Operation::arguments)
            .collect()
    }
}

/// Values collected from the tokens before assembly.
#[derive(Debug, Default)]
struct Pending {
    width: Option<u32>,
    height: Option<u32>,
    rotate: Option<String>,
    crop: Option<Rect>,
}

/// Parse a transform suffix.
///
/// `max_dimension` clamps width and height independently.
///
/// # Errors
/// [`ThumbError::Parse`] when characters remain that no token matches.
pub fn parse(options: &str, max_dimension: u32) -> Result<TransformSpec, ThumbError> {
    let mut pending = Pending::default();
    let mut rest = options;

    while !rest.is_empty() {
        let Some((kind, caps)) = longest_token(rest) else {
            return Err(ThumbError::Parse(format!(
                "unrecognised transform '{rest}' in '{options}'"
            )));
        };
        let consumed = caps[0].len();
        match kind {
            TokenKind::Width => pending.width = Some(clamped(&caps[1], max_dimension)),
            TokenKind::Height => pending.height = Some(clamped(&caps[1], max_dimension)),
            TokenKind::Rotate => pending.rotate = Some(caps[1].to_string()),
            TokenKind::Crop => {
                pending.crop = Some(Rect {
                    width: caps[1].to_string(),
                    height: caps[2].to_string(),
                    x_offset: caps[3].to_string(),
                    y_offset: caps[4].to_string(),
                })
            }
        }
        rest = &rest[consumed..];
    }

    Ok(assemble(pending, max_dimension))
}

fn longest_token(input: &str) -> Option<(TokenKind, Captures<'_>)> {
    TOKENS
        .iter()
        .filter_map(|(kind, re)| re.captures(input).map(|caps| (*kind, caps)))
        .max_by_key(|(_, caps)| caps[0].len())
}

/// Width and height saturate instead of failing: they are clamped anyway.
fn clamped(digits: &str, max_dimension: u32) -> u32 {
    digits
        .parse::<u64>()
        .unwrap_or(u64::MAX)
        .min(u64::from(max_dimension)) as u32
}

fn is_zero(digits: &str) -> bool {
    digits.bytes().all(|b| b == b'0')
}

fn assemble(pending: Pending, max_dimension: u32) -> TransformSpec {
    let mut operations = Vec::with_capacity(5);

    if let (Some(w), Some(h)) = (pending.width, pending.height) {
        let (w2, h2) = (u64::from(w) * 2, u64::from(h) * 2);
        let max = u64::from(max_dimension);
        if w > 0 && h > 0 && w2 < max && h2 < max {
            operations.push(Operation::PreSize {
                width: w2 as u32,
                height: h2 as u32,
            });
        }
    }
    if let Some(rect) = pending.crop {
        operations.push(Operation::Crop(rect));
    }
    if let Some(degrees) = pending.rotate.filter(|d| !is_zero(d)) {
        operations.push(Operation::Rotate(degrees));
    }
    if pending.width.is_some() || pending.height.is_some() {
        operations.push(Operation::Resize {
            width: pending.width,
            height: pending.height,
        });
    }
    operations.push(Operation::StripMetadata);

    TransformSpec { operations }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 2000;

    fn crop_10x10() -> Operation {
        Operation::Crop(Rect {
            width: "10".into(),
            height: "10".into(),
            x_offset: "5".into(),
            y_offset: "5".into(),
        })
    }

    #[test]
    fn full_suffix_in_fixed_order() {
        let spec = parse("w100h50r90c10x10+5+5", MAX).unwrap();
        assert_eq!(
            spec.operations(),
            &[
                Operation::PreSize {
                    width: 200,
                    height: 100
                },
                crop_10x10(),
                Operation::Rotate("90".into()),
                Operation::Resize {
                    width: Some(100),
                    height: Some(50)
                },
                Operation::StripMetadata,
            ]
        );
    }

    #[test]
    fn token_order_does_not_matter() {
        let expected = parse("w100h50r90c10x10+5+5", MAX).unwrap();
        for permutation in [
            "c10x10+5+5r90h50w100",
            "r90w100c10x10+5+5h50",
            "h50c10x10+5+5w100r90",
        ] {
            assert_eq!(parse(permutation, MAX).unwrap(), expected, "{permutation}");
        }
    }

    #[test]
    fn parsing_is_deterministic() {
        let a = parse("c1x2+3+4w300", MAX).unwrap();
        let b = parse("c1x2+3+4w300", MAX).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.arguments(), b.arguments());
    }

    #[test]
    fn zero_rotation_is_dropped() {
        let spec = parse("r0w100", MAX).unwrap();
        assert!(!spec
            .operations()
            .iter()
            .any(|op| matches!(op, Operation::Rotate(_))));
        let spec = parse("r000", MAX).unwrap();
        assert_eq!(spec.operations(), &[Operation::StripMetadata]);
    }

    #[test]
    fn dimensions_clamped_to_max() {
        let spec = parse("w5000h3000", MAX).unwrap();
        assert_eq!(
            spec.operations(),
            &[
                Operation::Resize {
                    width: Some(MAX),
                    height: Some(MAX)
                },
                Operation::StripMetadata,
            ]
        );
    }

    #[test]
    fn huge_dimension_saturates() {
        let spec = parse("w99999999999999999999999", MAX).unwrap();
        assert_eq!(
            spec.operations()[0],
            Operation::Resize {
                width: Some(MAX),
                height: None
            }
        );
    }

    #[test]
    fn trailing_garbage_rejected() {
        for bad in ["w100x", "w", "x", "w100-", "c10x10+5", "W100", "r90 "] {
            let err = parse(bad, MAX).unwrap_err();
            assert!(matches!(err, ThumbError::Parse(_)), "{bad}");
        }
    }

    #[test]
    fn oversized_numbers_pass_through_verbatim() {
        let spec = parse("r4294967296", MAX).unwrap();
        assert_eq!(spec.arguments(), vec!["-rotate", "4294967296", "+profile", "*"]);

        let spec = parse("c4294967296x10+0+0", MAX).unwrap();
        assert_eq!(spec.arguments()[..2], ["-crop", "4294967296x10+0+0"]);

        let spec = parse("c99999999999999999999x1+007+0r0360", MAX).unwrap();
        assert_eq!(
            spec.arguments(),
            vec![
                "-crop",
                "99999999999999999999x1+007+0",
                "-rotate",
                "0360",
                "+profile",
                "*"
            ]
        );
    }

    #[test]
    fn long_zero_rotation_is_dropped() {
        let spec = parse("r00000000000000000000000", MAX).unwrap();
        assert_eq!(spec.operations(), &[Operation::StripMetadata]);
    }

    #[test]
    fn empty_suffix_strips_only() {
        let spec = parse("", MAX).unwrap();
        assert_eq!(spec.operations(), &[Operation::StripMetadata]);
        assert_eq!(spec.arguments(), vec!["+profile", "*"]);
        assert!(spec.input_arguments().is_empty());
    }

    #[test]
    fn single_side_resize_leaves_other_empty() {
        let spec = parse("h50", MAX).unwrap();
        assert_eq!(spec.arguments(), vec!["-resize", "x50", "+profile", "*"]);
        let spec = parse("w80", MAX).unwrap();
        assert_eq!(spec.arguments(), vec!["-resize", "80x", "+profile", "*"]);
    }

    #[test]
    fn last_token_wins() {
        let spec = parse("w10w20r5r7", MAX).unwrap();
        assert_eq!(
            spec.operations(),
            &[
                Operation::Rotate("7".into()),
                Operation::Resize {
                    width: Some(20),
                    height: None
                },
                Operation::StripMetadata,
            ]
        );
    }

    #[test]
    fn pre_size_uses_clamped_dimensions() {
        // 2 × 999 < 2000 → hint
        let spec = parse("w999h10", MAX).unwrap();
        assert_eq!(spec.input_arguments(), vec!["-size", "1998x20"]);
        // 2 × 1000 is not < 2000 → no hint
        let spec = parse("w1000h10", MAX).unwrap();
        assert!(spec.input_arguments().is_empty());
        // clamped to 2000 first, so no hint either
        let spec = parse("w9000h9000", MAX).unwrap();
        assert!(spec.input_arguments().is_empty());
        // needs both sides
        let spec = parse("w10", MAX).unwrap();
        assert!(spec.input_arguments().is_empty());
    }

    #[test]
    fn arguments_exclude_pre_size() {
        let spec = parse("w100h50r90c10x10+5+5", MAX).unwrap();
        assert_eq!(spec.input_arguments(), vec!["-size", "200x100"]);
        assert_eq!(
            spec.arguments(),
            vec![
                "-crop", "10x10+5+5", "-rotate", "90", "-resize", "100x50", "+profile", "*"
            ]
        );
    }

    #[test]
    fn crop_is_not_bounds_checked() {
        let spec = parse("c100000x100000+99999+99999", MAX).unwrap();
        assert_eq!(spec.arguments()[1], "100000x100000+99999+99999");
    }
}
