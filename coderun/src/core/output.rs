//! Post-processing of captured sandbox output.

use tracing::warn;

use crate::core::value::Image;

/// Prefix of a captured output line carrying a base64-encoded image.
pub const IMAGE_MARKER: &str = "IMAGE_BASE64:";

/// Captured text with embedded images pulled out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    /// Output with marker payloads removed.
    pub log: String,
    /// Images in order of appearance.
    pub images: Vec<Image>,
}

/// Split image marker payloads out of captured output.
///
/// Text before the marker on the same line stays in the log. A payload that
/// is not valid base64 is left in the log untouched.
pub fn extract_images(output: &str) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    for line in output.split_inclusive('\n') {
        let Some(idx) = line.find(IMAGE_MARKER) else {
            parsed.log.push_str(line);
            continue;
        };
        let payload = &line[idx + IMAGE_MARKER.len()..];
        match Image::from_base64(payload) {
            Ok(image) => {
                parsed.images.push(image);
                let prefix = &line[..idx];
                if !prefix.trim().is_empty() {
                    parsed.log.push_str(prefix.trim_end());
                    parsed.log.push('\n');
                }
            }
            Err(err) => {
                warn!(err = %err, "ignoring malformed image marker payload");
                parsed.log.push_str(line);
            }
        }
    }
    parsed
}

/// Append the notice for output the sandbox dropped past its byte limit.
pub fn with_truncation_notice(mut log: String, dropped: usize, label: &str) -> String {
    if dropped > 0 {
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&format!("[{label} truncated {dropped} bytes]\n"));
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_output_is_untouched() {
        let parsed = extract_images("hello\nworld\n");
        assert_eq!(parsed.log, "hello\nworld\n");
        assert!(parsed.images.is_empty());
    }

    #[test]
    fn extracts_marker_lines() {
        let output = "before\nIMAGE_BASE64:iVBORw==\nplot: IMAGE_BASE64:/w==\nafter";
        let parsed = extract_images(output);
        assert_eq!(parsed.images.len(), 2);
        assert_eq!(&parsed.images[0].data[..4], b"\x89PNG");
        assert_eq!(parsed.images[1].data, vec![0xff]);
        assert_eq!(parsed.log, "before\nplot:\nafter");
    }

    #[test]
    fn malformed_payload_stays_in_log() {
        let parsed = extract_images("IMAGE_BASE64:not base64!!\n");
        assert!(parsed.images.is_empty());
        assert_eq!(parsed.log, "IMAGE_BASE64:not base64!!\n");
    }

    #[test]
    fn truncation_notice_only_when_dropped() {
        assert_eq!(with_truncation_notice("short".to_string(), 0, "output"), "short");
        assert_eq!(
            with_truncation_notice("partial".to_string(), 11, "output"),
            "partial\n[output truncated 11 bytes]\n"
        );
    }
}
