//! The resume artifact: extent vectors as ASCII decimal records.
//!
//! First record is the accumulated block-size bitmask, then one
//! `physical logical length` triple per extent. Tokens are separated by
//! arbitrary whitespace so the artifact survives hand edits.

use frs_error::{FrsError, Result};
use frs_extent::{BlockBitmask, Extent, ExtentVector};
use frs_types::Offset;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

/// Render `vector` and `bitmask` into `writer`.
pub fn save_extents<T: Offset, W: Write>(
    writer: &mut W,
    vector: &ExtentVector<T>,
    bitmask: BlockBitmask<T>,
) -> Result<()> {
    writeln!(writer, "{}", bitmask.get())?;
    for extent in vector.iter() {
        writeln!(writer, "{} {} {}", extent.physical, extent.logical, extent.length)?;
    }
    Ok(())
}

/// Parse an artifact produced by [`save_extents`].
pub fn load_extents<T: Offset, R: Read>(
    reader: &mut R,
) -> Result<(ExtentVector<T>, BlockBitmask<T>)> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    let mut tokens = text.split_whitespace();
    let bitmask = parse_token(tokens.next())?;

    let mut vector = ExtentVector::new();
    loop {
        let Some(first) = tokens.next() else { break };
        let physical = parse_token(Some(first))?;
        let logical = parse_token(tokens.next())?;
        let length = parse_token(tokens.next())?;
        vector.push(Extent::new(physical, logical, length));
    }
    Ok((vector, BlockBitmask::from_raw(bitmask)))
}

fn parse_token<T: Offset>(token: Option<&str>) -> Result<T> {
    let token = token.ok_or_else(|| {
        FrsError::Invalid("truncated extent record in persistence file".to_owned())
    })?;
    token.parse().map_err(|_| {
        FrsError::Invalid(format!("bad decimal value in persistence file: {token:?}"))
    })
}

/// Write the artifact to `path`, replacing any previous content.
pub fn write_extents_file<T: Offset>(
    path: &Path,
    vector: &ExtentVector<T>,
    bitmask: BlockBitmask<T>,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    save_extents(&mut writer, vector, bitmask)?;
    writer.flush()?;
    debug!(
        target: "frs::io::persist",
        path = %path.display(),
        extents = vector.len(),
        "saved extents"
    );
    Ok(())
}

/// Read the artifact back from `path`.
pub fn read_extents_file<T: Offset>(path: &Path) -> Result<(ExtentVector<T>, BlockBitmask<T>)> {
    let mut file = File::open(path)?;
    load_extents(&mut file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use frs_extent::ExtentMap;

    fn sample() -> (ExtentVector<u64>, BlockBitmask<u64>) {
        let vector: ExtentVector<u64> = vec![
            Extent::new(8192, 0, 4096),
            Extent::new(40960, 4096, 8192),
            Extent::new(1_048_576, 12288, 4096),
        ]
        .into();
        let mut bitmask = BlockBitmask::new();
        bitmask.or_vector(&vector);
        (vector, bitmask)
    }

    #[test]
    fn round_trip_preserves_vector_and_bitmask() {
        let (vector, bitmask) = sample();
        let mut bytes = Vec::new();
        save_extents(&mut bytes, &vector, bitmask).unwrap();

        let (parsed, parsed_mask) = load_extents::<u64, _>(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed_mask, bitmask);
        assert_eq!(
            ExtentMap::from_vector(&parsed).unwrap(),
            ExtentMap::from_vector(&vector).unwrap()
        );
    }

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extents");
        let (vector, bitmask) = sample();
        write_extents_file(&path, &vector, bitmask).unwrap();
        let (parsed, parsed_mask) = read_extents_file::<u64>(&path).unwrap();
        assert_eq!(parsed, vector);
        assert_eq!(parsed_mask, bitmask);
    }

    #[test]
    fn empty_vector_round_trips() {
        let mut bytes = Vec::new();
        save_extents::<u64, _>(&mut bytes, &ExtentVector::new(), BlockBitmask::new()).unwrap();
        let (parsed, mask) = load_extents::<u64, _>(&mut bytes.as_slice()).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(mask.get(), 0);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut input = "4096\n100 200\n".as_bytes();
        let err = load_extents::<u64, _>(&mut input).unwrap_err();
        assert!(matches!(err, FrsError::Invalid(_)));
    }

    #[test]
    fn non_decimal_token_is_rejected() {
        let mut input = "4096\n100 200 bogus\n".as_bytes();
        let err = load_extents::<u64, _>(&mut input).unwrap_err();
        assert!(matches!(err, FrsError::Invalid(_)));
    }

    #[test]
    fn missing_bitmask_is_rejected() {
        let mut input = "".as_bytes();
        assert!(load_extents::<u64, _>(&mut input).is_err());
    }
}
