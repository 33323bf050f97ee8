//! Decoder for the device's handwritten notebook formats.
//!
//! Three layouts are understood, all little-endian:
//!
//! - legacy: one `<id>.lines` file holding every page, header
//!   `reMarkable lines with selections and layers`
//! - version 3 and version 5: one `<page>.rm` file per page, header
//!   `reMarkable .lines file, version=N` padded with spaces
//!
//! Every header is 43 bytes. Counts are checked against the bytes that are
//! left before anything is allocated, so corrupt or truncated input fails with
//! [`LinesError::MalformedStrokeData`] instead of panicking or exhausting
//! memory.

use thiserror::Error;

pub const HEADER_LEN: usize = 43;

const LEGACY_HEADER: &[u8; HEADER_LEN] = b"reMarkable lines with selections and layers";
const VERSIONED_PREFIX: &[u8] = b"reMarkable .lines file, version=";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinesError {
    #[error("Malformed stroke data at byte {offset}: {reason}")]
    MalformedStrokeData { offset: usize, reason: String },

    #[error("Unsupported notebook format version {0}")]
    UnsupportedVersion(String),
}

pub type Result<T> = std::result::Result<T, LinesError>;

/// On-disk layout of a notebook file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Legacy,
    V3,
    V5,
}

impl Version {
    fn stroke_header_len(self) -> usize {
        match self {
            Version::Legacy | Version::V3 => 20,
            Version::V5 => 24,
        }
    }

    fn sample_len(self) -> usize {
        match self {
            Version::Legacy => 20,
            Version::V3 | Version::V5 => 24,
        }
    }
}

/// One point of a stroke.
///
/// The legacy format stores five values per point; `speed` is always zero
/// there and the fifth value lands in `width`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub tilt: f32,
    pub speed: f32,
    pub width: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stroke {
    /// Raw pen code as stored on the device.
    pub pen: u32,
    /// Raw colour code: 0 black, 1 grey, 2 white.
    pub color: u32,
    /// Base width (the pen's size setting).
    pub width: f32,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Layer {
    pub strokes: Vec<Stroke>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub layers: Vec<Layer>,
}

impl Page {
    pub fn stroke_count(&self) -> usize {
        self.layers.iter().map(|l| l.strokes.len()).sum()
    }
}

/// Identify the format from the 43-byte header.
pub fn detect_version(data: &[u8]) -> Result<Version> {
    let Some(header) = data.get(..HEADER_LEN) else {
        return Err(malformed(data.len(), "file shorter than header"));
    };
    if header == LEGACY_HEADER {
        return Ok(Version::Legacy);
    }
    let Some(tail) = header.strip_prefix(VERSIONED_PREFIX) else {
        return Err(malformed(0, "unrecognised header"));
    };

    let text = std::str::from_utf8(tail)
        .map_err(|_| malformed(VERSIONED_PREFIX.len(), "version is not text"))?;
    let version = text.trim_end_matches(' ');
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(
            VERSIONED_PREFIX.len(),
            format!("bad version field {:?}", text),
        ));
    }
    match version {
        "3" => Ok(Version::V3),
        "5" => Ok(Version::V5),
        other => Err(LinesError::UnsupportedVersion(other.to_string())),
    }
}

/// Decode a notebook file into its pages.
pub fn decode(data: &[u8]) -> Result<Vec<Page>> {
    let version = detect_version(data)?;
    let mut reader = Reader {
        data,
        pos: HEADER_LEN,
    };

    let pages = match version {
        Version::Legacy => {
            let count = reader.u32("page count")?;
            if count == 0 {
                return Err(malformed(HEADER_LEN, "notebook has no pages"));
            }
            reader.ensure(count, 4, "page")?;
            let mut pages = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let layers = reader.u8("layer count")?;
                reader.skip(3, "page header")?;
                pages.push(read_page(&mut reader, u32::from(layers), version)?);
            }
            pages
        }
        Version::V3 | Version::V5 => {
            let layers = reader.u32("layer count")?;
            vec![read_page(&mut reader, layers, version)?]
        }
    };

    if reader.remaining() > 0 {
        return Err(malformed(
            reader.pos,
            format!("{} trailing bytes", reader.remaining()),
        ));
    }
    Ok(pages)
}

fn read_page(reader: &mut Reader<'_>, layers: u32, version: Version) -> Result<Page> {
    reader.ensure(layers, 4, "layer")?;
    let mut page = Page {
        layers: Vec::with_capacity(layers as usize),
    };
    for _ in 0..layers {
        let count = reader.u32("stroke count")?;
        reader.ensure(count, version.stroke_header_len(), "stroke")?;
        let mut strokes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            strokes.push(read_stroke(reader, version)?);
        }
        page.layers.push(Layer { strokes });
    }
    Ok(page)
}

fn read_stroke(reader: &mut Reader<'_>, version: Version) -> Result<Stroke> {
    let pen = reader.u32("pen")?;
    let color = reader.u32("colour")?;
    reader.skip(4, "stroke header")?;
    let width = reader.f32("width")?;
    if version == Version::V5 {
        reader.skip(4, "stroke header")?;
    }
    let count = reader.u32("sample count")?;
    reader.ensure(count, version.sample_len(), "sample")?;

    let mut samples = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let sample = match version {
            Version::Legacy => Sample {
                x: reader.f32("x")?,
                y: reader.f32("y")?,
                pressure: reader.f32("pressure")?,
                tilt: reader.f32("tilt")?,
                speed: 0.0,
                width: reader.f32("width")?,
            },
            Version::V3 | Version::V5 => {
                let x = reader.f32("x")?;
                let y = reader.f32("y")?;
                let speed = reader.f32("speed")?;
                let tilt = reader.f32("tilt")?;
                let width = reader.f32("width")?;
                let pressure = reader.f32("pressure")?;
                Sample {
                    x,
                    y,
                    pressure,
                    tilt,
                    speed,
                    width,
                }
            }
        };
        samples.push(sample);
    }

    Ok(Stroke {
        pen,
        color,
        width,
        samples,
    })
}

/// Encode pages in the given layout. Versions 3 and 5 hold a single page;
/// only the first page is written for them.
pub fn encode(pages: &[Page], version: Version) -> Vec<u8> {
    let mut out = Vec::new();
    match version {
        Version::Legacy => {
            out.extend_from_slice(LEGACY_HEADER);
            out.extend_from_slice(&(pages.len() as u32).to_le_bytes());
            for page in pages {
                let layers = &page.layers[..page.layers.len().min(u8::MAX as usize)];
                out.push(layers.len() as u8);
                out.extend_from_slice(&[0; 3]);
                write_layers(&mut out, layers, version);
            }
        }
        Version::V3 | Version::V5 => {
            let number = if version == Version::V3 { 3 } else { 5 };
            out.extend_from_slice(VERSIONED_PREFIX);
            let padded = format!(
                "{:<width$}",
                number,
                width = HEADER_LEN - VERSIONED_PREFIX.len()
            );
            out.extend_from_slice(padded.as_bytes());
            let layers = pages.first().map(|p| p.layers.as_slice()).unwrap_or(&[]);
            out.extend_from_slice(&(layers.len() as u32).to_le_bytes());
            write_layers(&mut out, layers, version);
        }
    }
    out
}

fn write_layers(out: &mut Vec<u8>, layers: &[Layer], version: Version) {
    for layer in layers {
        out.extend_from_slice(&(layer.strokes.len() as u32).to_le_bytes());
        for stroke in &layer.strokes {
            out.extend_from_slice(&stroke.pen.to_le_bytes());
            out.extend_from_slice(&stroke.color.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&stroke.width.to_le_bytes());
            if version == Version::V5 {
                out.extend_from_slice(&0u32.to_le_bytes());
            }
            out.extend_from_slice(&(stroke.samples.len() as u32).to_le_bytes());
            for s in &stroke.samples {
                let values = match version {
                    Version::Legacy => [s.x, s.y, s.pressure, s.tilt, s.width].to_vec(),
                    Version::V3 | Version::V5 => [s.x, s.y, s.speed, s.tilt, s.width, s.pressure].to_vec(),
                };
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }
}

fn malformed(offset: usize, reason: impl Into<String>) -> LinesError {
    LinesError::MalformedStrokeData {
        offset,
        reason: reason.into(),
    }
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(malformed(self.pos, format!("truncated {}", what)));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize, what: &str) -> Result<()> {
        self.take(n, what).map(|_| ())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N, what)?);
        Ok(buf)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.array::<4>(what).map(u32::from_le_bytes)
    }

    fn f32(&mut self, what: &str) -> Result<f32> {
        self.array::<4>(what).map(f32::from_le_bytes)
    }

    /// Reject a count that cannot fit in the remaining input.
    fn ensure(&self, count: u32, min_each: usize, what: &str) -> Result<()> {
        let needed = (count as usize).checked_mul(min_each);
        match needed {
            Some(needed) if needed <= self.remaining() => Ok(()),
            _ => Err(malformed(
                self.pos,
                format!(
                    "{} {} entries do not fit in {} remaining bytes",
                    count,
                    what,
                    self.remaining()
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke(pen: u32, points: &[(f32, f32)]) -> Stroke {
        Stroke {
            pen,
            color: 0,
            width: 2.0,
            samples: points
                .iter()
                .map(|&(x, y)| Sample {
                    x,
                    y,
                    pressure: 0.5,
                    tilt: 0.25,
                    speed: 0.0,
                    width: 2.125,
                })
                .collect(),
        }
    }

    fn sample_page() -> Page {
        Page {
            layers: vec![
                Layer {
                    strokes: vec![
                        stroke(2, &[(10.0, 20.0), (30.0, 40.0), (50.0, 45.5)]),
                        stroke(5, &[(100.0, 100.0), (200.0, 100.0)]),
                    ],
                },
                Layer {
                    strokes: vec![stroke(17, &[(1.0, 1.0)])],
                },
            ],
        }
    }

    #[test]
    fn test_decode_encoded_pages_in_every_version() {
        let page = sample_page();
        let legacy = vec![page.clone(), Page::default(), page.clone()];
        let decoded = decode(&encode(&legacy, Version::Legacy)).unwrap();
        assert_eq!(decoded, legacy);
        let counts: Vec<_> = decoded.iter().map(Page::stroke_count).collect();
        assert_eq!(counts, vec![3, 0, 3]);

        let mut fast = page.clone();
        fast.layers[0].strokes[0].samples[1].speed = 3.5;
        for version in [Version::V3, Version::V5] {
            let bytes = encode(std::slice::from_ref(&fast), version);
            assert_eq!(detect_version(&bytes).unwrap(), version);
            assert_eq!(decode(&bytes).unwrap(), vec![fast.clone()]);
        }
    }

    #[test]
    fn test_every_prefix_is_malformed() {
        for version in [Version::Legacy, Version::V3, Version::V5] {
            let bytes = encode(&[sample_page()], version);
            for len in 0..bytes.len() {
                match decode(&bytes[..len]) {
                    Err(LinesError::MalformedStrokeData { .. }) => {}
                    other => panic!("{:?} prefix of {} bytes: {:?}", version, len, other),
                }
            }
        }
    }

    #[test]
    fn test_versioned_header_layout() {
        let bytes = encode(&[Page::default()], Version::V5);
        assert_eq!(&bytes[..HEADER_LEN], b"reMarkable .lines file, version=5          ");
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(decode(&bytes).unwrap(), vec![Page::default()]);
    }

    #[test]
    fn test_unknown_version_is_unsupported() {
        let mut bytes = encode(&[Page::default()], Version::V3);
        bytes[VERSIONED_PREFIX.len()] = b'6';
        assert_eq!(
            decode(&bytes),
            Err(LinesError::UnsupportedVersion("6".to_string()))
        );

        bytes[VERSIONED_PREFIX.len()] = b'x';
        assert!(matches!(
            decode(&bytes),
            Err(LinesError::MalformedStrokeData { .. })
        ));
    }

    #[test]
    fn test_garbage_header() {
        let bytes = vec![0xffu8; 128];
        assert!(matches!(
            decode(&bytes),
            Err(LinesError::MalformedStrokeData { offset: 0, .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = encode(&[sample_page()], Version::V3);
        bytes.push(0);
        assert!(matches!(
            decode(&bytes),
            Err(LinesError::MalformedStrokeData { reason, .. }) if reason.contains("trailing")
        ));
    }

    #[test]
    fn test_legacy_needs_a_page() {
        let bytes = encode(&[], Version::Legacy);
        assert!(matches!(
            decode(&bytes),
            Err(LinesError::MalformedStrokeData { offset: HEADER_LEN, .. })
        ));
    }

    #[test]
    fn test_huge_counts_fail_before_allocating() {
        let mut bytes = encode(&[Page::default()], Version::V3);
        bytes.truncate(HEADER_LEN);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, LinesError::MalformedStrokeData { offset, .. } if offset == HEADER_LEN + 8));
    }

    #[test]
    fn test_v5_reserved_field_is_skipped() {
        let page = Page {
            layers: vec![Layer {
                strokes: vec![stroke(15, &[(5.0, 6.0)])],
            }],
        };
        let mut bytes = encode(&[page.clone()], Version::V5);
        // pen, colour, reserved, width, then the v5-only field
        let reserved = HEADER_LEN + 4 + 4 + 16;
        bytes[reserved..reserved + 4].copy_from_slice(&0.75f32.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap(), vec![page]);
    }
}
