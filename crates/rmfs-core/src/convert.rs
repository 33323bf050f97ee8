//! Upload content detection and conversion.
//!
//! The device only opens PDF and EPUB. PostScript and DjVu uploads are
//! converted to PDF with the host's `ps2pdf` and `ddjvu` before upload.

use crate::record::DocumentKind;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Unsupported file content")]
    Unsupported,

    #[error("{program} failed: {message}")]
    Failed { program: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Formats recognised from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Epub,
    PostScript,
    Djvu,
}

pub fn sniff(data: &[u8]) -> Option<Format> {
    if data.starts_with(b"%PDF") {
        Some(Format::Pdf)
    } else if data.starts_with(b"PK") {
        Some(Format::Epub)
    } else if data.starts_with(b"%!PS-Adobe") {
        Some(Format::PostScript)
    } else if data.starts_with(b"AT&TFORM") {
        Some(Format::Djvu)
    } else {
        None
    }
}

/// Turn uploaded bytes into a device payload and the kind it is stored as.
pub async fn prepare_upload(data: Vec<u8>) -> Result<(DocumentKind, Vec<u8>)> {
    match sniff(&data) {
        Some(Format::Pdf) => Ok((DocumentKind::Pdf, data)),
        Some(Format::Epub) => Ok((DocumentKind::Epub, data)),
        Some(Format::PostScript) => {
            let pdf = run_converter("ps2pdf", &[], &data).await?;
            Ok((DocumentKind::Pdf, pdf))
        }
        Some(Format::Djvu) => {
            let pdf = run_converter("ddjvu", &["--format=pdf"], &data).await?;
            Ok((DocumentKind::Pdf, pdf))
        }
        None => Err(ConvertError::Unsupported),
    }
}

/// Run `program [args] <input> <output>` in a scratch directory and return
/// the PDF it wrote.
async fn run_converter(program: &str, args: &[&str], data: &[u8]) -> Result<Vec<u8>> {
    let scratch = tempfile::tempdir()?;
    let input = scratch.path().join("input");
    let output = scratch.path().join("output.pdf");
    tokio::fs::write(&input, data).await?;

    tracing::debug!("Converting {} bytes with {}", data.len(), program);
    let result = Command::new(program)
        .args(args)
        .arg(&input)
        .arg(&output)
        .output()
        .await
        .map_err(|e| failed(program, e.to_string()))?;

    if !result.status.success() {
        return Err(failed(
            program,
            format!(
                "{}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            ),
        ));
    }
    read_pdf(program, &output).await
}

async fn read_pdf(program: &str, path: &Path) -> Result<Vec<u8>> {
    let pdf = tokio::fs::read(path)
        .await
        .map_err(|e| failed(program, format!("no output: {}", e)))?;
    if sniff(&pdf) != Some(Format::Pdf) {
        return Err(failed(program, "output is not a PDF".to_string()));
    }
    Ok(pdf)
}

fn failed(program: &str, message: String) -> ConvertError {
    ConvertError::Failed {
        program: program.to_string(),
        message,
    }
}
