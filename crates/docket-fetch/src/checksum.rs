use crate::FetchError;
use docket_schema::{Checksum, ChecksumAlgorithm};
use sha2::{Digest, Sha256};

/// Lowercase hex digest of `data` under `algorithm`.
pub fn digest_hex(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        ChecksumAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
    }
}

/// `algorithm:hex` string for `data`, in the same form checksums are pinned.
pub fn compute_checksum(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    format!("{algorithm}:{}", digest_hex(algorithm, data))
}

/// Compare `data` against `expected` exactly, using the expected algorithm.
pub fn verify_checksum(name: &str, expected: &Checksum, data: &[u8]) -> Result<(), FetchError> {
    let actual = digest_hex(expected.algorithm(), data);
    if actual != expected.digest() {
        return Err(FetchError::ChecksumMismatch {
            name: name.to_owned(),
            expected: expected.to_string(),
            actual: format!("{}:{actual}", expected.algorithm()),
        });
    }
    Ok(())
}

/// Parse a published `<archive>.sha256` file (`<hex>  <file name>` or just `<hex>`).
///
/// When the file names an archive it must be `expected_file`.
pub fn parse_checksum_file(
    file: &str,
    content: &[u8],
    expected_file: &str,
) -> Result<Checksum, FetchError> {
    let malformed = |reason: &str| FetchError::MalformedChecksumFile {
        file: file.to_owned(),
        reason: reason.to_owned(),
    };
    let text = std::str::from_utf8(content).map_err(|_| malformed("not valid UTF-8"))?;
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| malformed("empty"))?;

    let mut fields = line.split_whitespace();
    let digest = fields.next().ok_or_else(|| malformed("empty"))?;
    if let Some(named) = fields.next() {
        let named = named.trim_start_matches('*');
        let base = named.rsplit('/').next().unwrap_or(named);
        if base != expected_file {
            return Err(malformed(&format!(
                "names '{named}', expected '{expected_file}'"
            )));
        }
    }
    Checksum::sha256(digest).map_err(|e| malformed(&e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn sha256_matches_known_vector() {
        let c = compute_checksum(ChecksumAlgorithm::Sha256, b"hello");
        assert_eq!(c, format!("sha256:{HELLO_SHA256}"));
    }

    #[test]
    fn blake3_matches_crate_output() {
        let hex = digest_hex(ChecksumAlgorithm::Blake3, b"hello");
        assert_eq!(hex, blake3::hash(b"hello").to_hex().as_str());
    }

    #[test]
    fn verify_accepts_exact_match() {
        let expected = Checksum::sha256(HELLO_SHA256).unwrap();
        verify_checksum("hello", &expected, b"hello").unwrap();
    }

    #[test]
    fn single_byte_change_is_a_mismatch() {
        let expected = Checksum::sha256(HELLO_SHA256).unwrap();
        let err = verify_checksum("hello", &expected, b"hellp").unwrap_err();
        assert!(err.is_integrity_failure());
        match err {
            FetchError::ChecksumMismatch { expected, actual, .. } => {
                assert_ne!(expected, actual);
                assert!(actual.starts_with("sha256:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parses_sha256sum_format() {
        let content = format!("{HELLO_SHA256}  s6-overlay-noarch.tar.xz\n");
        let c = parse_checksum_file("x.sha256", content.as_bytes(), "s6-overlay-noarch.tar.xz")
            .unwrap();
        assert_eq!(c.digest(), HELLO_SHA256);
    }

    #[test]
    fn parses_bare_digest_and_binary_marker() {
        parse_checksum_file("x", HELLO_SHA256.as_bytes(), "a.tar.xz").unwrap();
        let content = format!("{HELLO_SHA256} *dist/a.tar.xz");
        parse_checksum_file("x", content.as_bytes(), "a.tar.xz").unwrap();
    }

    #[test]
    fn rejects_checksum_for_another_file() {
        let content = format!("{HELLO_SHA256}  other.tar.xz\n");
        let err = parse_checksum_file("x", content.as_bytes(), "a.tar.xz").unwrap_err();
        assert!(matches!(err, FetchError::MalformedChecksumFile { .. }));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse_checksum_file("x", b"", "a").is_err());
        assert!(parse_checksum_file("x", b"\n\n", "a").is_err());
        assert!(parse_checksum_file("x", b"not-a-digest  a", "a").is_err());
        assert!(parse_checksum_file("x", &[0xff, 0xfe], "a").is_err());
    }
}
