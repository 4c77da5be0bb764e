//! Compression codecs and the compression setting used when saving.
//!
//! A [`Compression`] is a codec plus a level. The named presets map as:
//!
//! | preset   | codec | level |
//! |----------|-------|-------|
//! | `none`   | raw   | -     |
//! | `low`    | gzip  | 1     |
//! | `medium` | gzip  | 5     |
//! | `high`   | xz    | 9     |
//!
//! Literal codec names (`gzip`, `bz2`, `xz`, ...) are accepted too,
//! optionally with a level suffix such as `gzip:9`. The codec of an
//! existing archive is recovered from its file extension.

use std::{
    fmt,
    io::{self, Read, Write},
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Codec applied to a serialized archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// No compression.
    Raw,
    /// gzip (deflate).
    Gzip,
    /// bzip2.
    Bzip2,
    /// xz (lzma2).
    Xz,
}

impl Codec {
    /// File extension (without dot) marking this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Raw => "none",
            Codec::Gzip => "gz",
            Codec::Bzip2 => "bz2",
            Codec::Xz => "xz",
        }
    }

    /// Codec implied by the extension of `path`, if recognized.
    pub fn from_path(path: &Path) -> Option<Codec> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "none" => Some(Codec::Raw),
            "gz" | "gzip" => Some(Codec::Gzip),
            "bz2" | "bzip2" => Some(Codec::Bzip2),
            "xz" | "lzma" => Some(Codec::Xz),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Codec> {
        match name {
            "raw" | "none" => Some(Codec::Raw),
            "gzip" | "gz" => Some(Codec::Gzip),
            "bzip2" | "bz2" => Some(Codec::Bzip2),
            "lzma" | "xz" => Some(Codec::Xz),
            _ => None,
        }
    }

    fn default_level(&self) -> u32 {
        match self {
            Codec::Raw => 0,
            Codec::Gzip => 6,
            Codec::Bzip2 | Codec::Xz => 9,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::Raw => "raw",
            Codec::Gzip => "gzip",
            Codec::Bzip2 => "bzip2",
            Codec::Xz => "xz",
        };
        f.write_str(name)
    }
}

/// Error from strict parsing of a compression setting.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseCompressionError {
    /// Neither a preset nor a known codec name.
    #[snafu(display(
        "unknown compression format '{input}' (expected none|low|medium|high or raw|gzip|bzip2|xz[:level])"
    ))]
    UnknownFormat {
        /// The rejected input.
        input: String,
    },
}

/// Codec and level used when writing an archive.
///
/// Serializes as its display string (`"medium"`, `"bzip2:4"`); unknown
/// strings deserialize leniently to [`Compression::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Compression {
    /// Codec to apply.
    pub codec: Codec,
    /// Codec-specific level; ignored for [`Codec::Raw`].
    pub level: u32,
}

impl Compression {
    /// `none` preset.
    pub const NONE: Compression = Compression {
        codec: Codec::Raw,
        level: 0,
    };
    /// `low` preset.
    pub const LOW: Compression = Compression {
        codec: Codec::Gzip,
        level: 1,
    };
    /// `medium` preset.
    pub const MEDIUM: Compression = Compression {
        codec: Codec::Gzip,
        level: 5,
    };
    /// `high` preset.
    pub const HIGH: Compression = Compression {
        codec: Codec::Xz,
        level: 9,
    };

    /// Parse like [`FromStr`] but fall back to uncompressed, with a warning,
    /// for anything unrecognized.
    pub fn parse_lenient(input: &str) -> Compression {
        match input.parse() {
            Ok(c) => c,
            Err(e) => {
                log::warn!("{e}; writing uncompressed");
                Compression::NONE
            }
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::MEDIUM
    }
}

impl FromStr for Compression {
    type Err = ParseCompressionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let spec = input.trim().to_ascii_lowercase();
        match spec.as_str() {
            "none" => return Ok(Compression::NONE),
            "low" => return Ok(Compression::LOW),
            "medium" => return Ok(Compression::MEDIUM),
            "high" => return Ok(Compression::HIGH),
            _ => {}
        }

        let (name, level) = match spec.split_once(':') {
            Some((name, level)) => (name.trim(), Some(level.trim())),
            None => (spec.as_str(), None),
        };
        let codec = Codec::from_name(name).context(UnknownFormatSnafu { input })?;
        let level = match level {
            Some(l) => l.parse().ok().context(UnknownFormatSnafu { input })?,
            None => codec.default_level(),
        };
        Ok(Compression { codec, level })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Compression::NONE => f.write_str("none"),
            Compression::LOW => f.write_str("low"),
            Compression::MEDIUM => f.write_str("medium"),
            Compression::HIGH => f.write_str("high"),
            Compression { codec, level } => write!(f, "{codec}:{level}"),
        }
    }
}

impl From<String> for Compression {
    fn from(s: String) -> Self {
        Compression::parse_lenient(&s)
    }
}

impl From<Compression> for String {
    fn from(c: Compression) -> Self {
        c.to_string()
    }
}

/// Errors from compressing or decompressing a buffer.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// The encoder failed.
    #[snafu(display("{codec} compression failed: {source}"))]
    Compress {
        /// Codec in use.
        codec: Codec,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The input is not a valid stream for the codec.
    #[snafu(display("{codec} decompression failed: {source}"))]
    Decompress {
        /// Codec in use.
        codec: Codec,
        /// Underlying I/O error.
        source: io::Error,
    },
}

fn encode_with<W: Write>(mut encoder: W, bytes: &[u8]) -> io::Result<W> {
    encoder.write_all(bytes)?;
    Ok(encoder)
}

/// Compress `bytes` according to `compression`.
///
/// # Errors
///
/// [`CodecError::Compress`] if the encoder reports an I/O failure.
pub fn compress(compression: Compression, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let codec = compression.codec;
    let out = match codec {
        Codec::Raw => Ok(bytes.to_vec()),
        Codec::Gzip => {
            let level = flate2::Compression::new(compression.level.min(9));
            encode_with(flate2::write::GzEncoder::new(Vec::new(), level), bytes)
                .and_then(|e| e.finish())
        }
        Codec::Bzip2 => {
            let level = bzip2::Compression::new(compression.level.clamp(1, 9));
            encode_with(bzip2::write::BzEncoder::new(Vec::new(), level), bytes)
                .and_then(|e| e.finish())
        }
        Codec::Xz => encode_with(
            xz2::write::XzEncoder::new(Vec::new(), compression.level.min(9)),
            bytes,
        )
        .and_then(|e| e.finish()),
    };
    out.context(CompressSnafu { codec })
}

/// Decompress `bytes` that were written with `codec`.
///
/// # Errors
///
/// [`CodecError::Decompress`] if the stream is truncated or corrupt.
pub fn decompress(codec: Codec, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let res = match codec {
        Codec::Raw => {
            out.extend_from_slice(bytes);
            Ok(out.len())
        }
        Codec::Gzip => flate2::read::GzDecoder::new(bytes).read_to_end(&mut out),
        Codec::Bzip2 => bzip2::read::BzDecoder::new(bytes).read_to_end(&mut out),
        Codec::Xz => xz2::read::XzDecoder::new(bytes).read_to_end(&mut out),
    };
    res.context(DecompressSnafu { codec })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn presets_map_to_codec_and_level() {
        assert_eq!("none".parse(), Ok(Compression::NONE));
        assert_eq!(
            "low".parse(),
            Ok(Compression {
                codec: Codec::Gzip,
                level: 1
            })
        );
        assert_eq!(
            "Medium".parse(),
            Ok(Compression {
                codec: Codec::Gzip,
                level: 5
            })
        );
        assert_eq!(
            "high".parse(),
            Ok(Compression {
                codec: Codec::Xz,
                level: 9
            })
        );
    }

    #[test]
    fn literal_codec_names_parse() {
        assert_eq!(
            "bz2".parse(),
            Ok(Compression {
                codec: Codec::Bzip2,
                level: 9
            })
        );
        assert_eq!(
            "gzip:3".parse(),
            Ok(Compression {
                codec: Codec::Gzip,
                level: 3
            })
        );
        assert_eq!("lzma:9".parse(), Ok(Compression::HIGH));
    }

    #[test]
    fn unknown_format_is_strict_error_but_lenient_fallback() {
        let err = "snappy".parse::<Compression>().unwrap_err();
        assert_eq!(
            err,
            ParseCompressionError::UnknownFormat {
                input: "snappy".to_string()
            }
        );
        assert!("gzip:fast".parse::<Compression>().is_err());
        assert_eq!(Compression::parse_lenient("snappy"), Compression::NONE);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for c in [
            Compression::NONE,
            Compression::LOW,
            Compression::MEDIUM,
            Compression::HIGH,
            Compression {
                codec: Codec::Bzip2,
                level: 4,
            },
        ] {
            assert_eq!(c.to_string().parse(), Ok(c));
        }
    }

    #[test]
    fn codec_detected_from_extension() {
        let p = |s: &str| PathBuf::from(s);
        assert_eq!(Codec::from_path(&p("a.tscache.gz")), Some(Codec::Gzip));
        assert_eq!(Codec::from_path(&p("a.tscache.bz2")), Some(Codec::Bzip2));
        assert_eq!(Codec::from_path(&p("a.tscache.xz")), Some(Codec::Xz));
        assert_eq!(Codec::from_path(&p("a.tscache.none")), Some(Codec::Raw));
        assert_eq!(Codec::from_path(&p("a.tscache")), None);
    }

    #[test]
    fn every_codec_round_trips() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        for codec in [Codec::Raw, Codec::Gzip, Codec::Bzip2, Codec::Xz] {
            let c = Compression {
                codec,
                level: codec.default_level(),
            };
            let packed = compress(c, &payload).expect("compress");
            assert_eq!(decompress(codec, &packed).expect("decompress"), payload);
        }
    }

    #[test]
    fn corrupt_stream_fails_to_decompress() {
        for codec in [Codec::Gzip, Codec::Bzip2, Codec::Xz] {
            let err = decompress(codec, b"definitely not compressed").unwrap_err();
            assert!(matches!(err, CodecError::Decompress { .. }));
        }
    }
}
