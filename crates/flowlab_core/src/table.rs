//! Plain-text tables of sweep records, used as checkpoints.
//!
//! One record per row: the parameter value followed by the recorded values,
//! tab separated. Reading accepts any whitespace, and skips blank lines and
//! lines starting with `#`. A failed point is a row holding only the
//! parameter.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::sweep::BifurcationRecord;

pub fn write_records<W: Write>(mut writer: W, records: &[BifurcationRecord]) -> Result<()> {
    for record in records {
        write!(writer, "{}", record.param).context("Failed to write record")?;
        for value in &record.values {
            write!(writer, "\t{}", value).context("Failed to write record")?;
        }
        writeln!(writer).context("Failed to write record")?;
    }
    writer.flush().context("Failed to flush records")?;
    Ok(())
}

/// Every row must end with a newline; a last row without one is a write
/// that was cut short and is rejected rather than trusted.
pub fn read_records<R: BufRead>(mut reader: R) -> Result<Vec<BifurcationRecord>> {
    let mut records = Vec::new();
    let mut line = String::new();
    let mut line_no = 0;
    loop {
        line.clear();
        line_no += 1;
        let read = reader
            .read_line(&mut line)
            .with_context(|| format!("Failed to read line {}", line_no))?;
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if !line.ends_with('\n') {
            bail!("Line {}: row is truncated (no line terminator)", line_no);
        }
        let mut fields = trimmed.split_whitespace().map(|field| {
            field
                .parse::<f64>()
                .with_context(|| format!("Line {}: '{}' is not a number", line_no, field))
        });
        let param = match fields.next() {
            Some(param) => param?,
            None => continue,
        };
        if !param.is_finite() {
            bail!("Line {}: parameter value must be finite", line_no);
        }
        let values = fields.collect::<Result<Vec<f64>>>()?;
        records.push(BifurcationRecord { param, values });
    }
    Ok(records)
}

/// Writes `records` to `path`, replacing any previous checkpoint.
///
/// The table goes to a sibling `.tmp` file first and is renamed over `path`,
/// so an interrupted write leaves the previous checkpoint intact.
pub fn save_checkpoint(path: impl AsRef<Path>, records: &[BifurcationRecord]) -> Result<()> {
    let path = path.as_ref();
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let file = File::create(&tmp)
        .with_context(|| format!("Failed to create checkpoint {}", tmp.display()))?;
    let mut writer = BufWriter::new(file);
    write_records(&mut writer, records)
        .with_context(|| format!("Failed to write checkpoint {}", tmp.display()))?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush checkpoint {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync checkpoint {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| {
        format!(
            "Failed to move checkpoint {} into place at {}",
            tmp.display(),
            path.display()
        )
    })
}

/// Records saved at `path`, or none when no checkpoint exists yet.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Vec<BifurcationRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file =
        File::open(path).with_context(|| format!("Failed to open checkpoint {}", path.display()))?;
    read_records(BufReader::new(file))
        .with_context(|| format!("Failed to parse checkpoint {}", path.display()))
}
