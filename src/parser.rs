//! Bypass rule file parsing and bootstrap.
//!
//! One `<pattern> <mode>` pair per line. Lines starting with `#`, lines that
//! do not fit the format and lines with an unknown mode are skipped.

use std::fs;
use std::io::Write;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{BypassError, Result};
use crate::types::{Mark, TextRule};

/// Rule set written when the rule file is missing and cannot be downloaded.
pub const DEFAULT_RULES: &str = include_str!("default_bypass.conf");

/// Format: pattern, one or more spaces, mode, optional trailing spaces.
static RULE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^ ]+) +([^ ]+) *$").expect("RULE_PATTERN: hardcoded regex is invalid")
});

/// Parse bypass rules from text.
pub fn parse_rules(text: &str) -> Vec<TextRule> {
    let mut rules = Vec::new();

    for (line_num, line) in text.lines().enumerate() {
        let line_num = line_num + 1;
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.starts_with('#') {
            continue;
        }
        let Some(captures) = RULE_PATTERN.captures(line) else {
            if !line.trim().is_empty() {
                debug!(line = line_num, "skipping malformed rule line");
            }
            continue;
        };

        let (pattern, mode) = (&captures[1], &captures[2]);
        match mode.parse::<Mark>() {
            Ok(mark) => rules.push(TextRule {
                pattern: pattern.to_string(),
                mark,
                line_num,
            }),
            Err(_) => debug!(line = line_num, mode, "skipping rule with unknown mode"),
        }
    }

    rules
}

/// Read and parse a rule file.
///
/// Lines that are not valid UTF-8 are skipped like any other malformed line.
pub fn parse_rules_from_file(path: impl AsRef<Path>) -> Result<Vec<TextRule>> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| {
        BypassError::ConfigError(format!(
            "Failed to read rules file '{}': {}",
            path.display(),
            e
        ))
    })?;
    Ok(parse_rules(&decode_lines(&bytes)))
}

/// Decode line by line, blanking undecodable lines so numbering is kept.
fn decode_lines(bytes: &[u8]) -> String {
    bytes
        .split(|b| *b == b'\n')
        .enumerate()
        .map(|(i, line)| {
            std::str::from_utf8(line).unwrap_or_else(|_| {
                debug!(line = i + 1, "skipping rule line that is not valid UTF-8");
                ""
            })
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Make sure a rule file exists at `path`.
///
/// A missing file is fetched from `url` when given, otherwise (or when the
/// download fails) the bundled [`DEFAULT_RULES`] are written. Blocking.
pub fn ensure_rules_file(path: impl AsRef<Path>, url: Option<&str>) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        return Ok(());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            BypassError::ConfigError(format!(
                "Failed to create rules directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }

    if let Some(url) = url {
        match download(path, url) {
            Ok(()) => {
                info!(path = %path.display(), url, "downloaded bypass rules");
                return Ok(());
            }
            Err(e) => warn!(url, error = %e, "bypass rules download failed, using bundled rules"),
        }
    }

    fs::write(path, DEFAULT_RULES).map_err(|e| {
        BypassError::ConfigError(format!(
            "Failed to write rules file '{}': {}",
            path.display(),
            e
        ))
    })?;
    info!(path = %path.display(), "wrote bundled bypass rules");
    Ok(())
}

/// Download to a temporary file next to `path`, then move it in place.
fn download(path: &Path, url: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");

    let response = ureq::get(url)
        .call()
        .map_err(|e| BypassError::ConfigError(format!("Download failed: {}", e)))?;

    let mut file = fs::File::create(&tmp_path)?;
    let (_, body) = response.into_parts();
    let mut reader = body.into_reader();
    let copied = std::io::copy(&mut reader, &mut file).and_then(|_| file.flush());
    drop(file);

    if let Err(e) = copied {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_pattern_regex_compiles() {
        assert!(RULE_PATTERN.is_match("example.com direct"));
        assert!(RULE_PATTERN.is_match("10.0.0.0/8   proxy  "));
        assert!(!RULE_PATTERN.is_match("example.com"));
        assert!(!RULE_PATTERN.is_match(" example.com direct"));
        assert!(!RULE_PATTERN.is_match("a b c"));
    }

    #[test]
    fn test_parse_simple_rules() {
        let rules = parse_rules("example.com direct\n10.0.0.0/8 BLOCK\n*.google.com proxy\n");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].pattern, "example.com");
        assert_eq!(rules[0].mark, Mark::Direct);
        assert_eq!(rules[0].line_num, 1);
        assert_eq!(rules[1].mark, Mark::Block);
        assert_eq!(rules[2].pattern, "*.google.com");
    }

    #[test]
    fn test_parse_skips_comments_and_garbage() {
        let text = "# header\n\nexample.com direct\nnot-a-rule\na b c\nexample.org reject\nexample.net ip\n";
        let rules = parse_rules(text);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern, "example.com");
        assert_eq!(rules[1].mark, Mark::IpOnly);
        assert_eq!(rules[1].line_num, 7);
    }

    #[test]
    fn test_parse_crlf_lines() {
        let rules = parse_rules("example.com direct\r\n1.2.3.4 ipdirect\r\n");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].mark, Mark::IpDirect);
    }

    #[test]
    fn test_default_rules_parse() {
        let rules = parse_rules(DEFAULT_RULES);
        assert!(!rules.is_empty());
        assert!(rules
            .iter()
            .any(|r| r.pattern == "192.168.0.0/16" && r.mark == Mark::Direct));
    }

    #[test]
    fn test_parse_file_not_found() {
        let result = parse_rules_from_file("/nonexistent/bypass.conf");
        assert!(matches!(result, Err(BypassError::ConfigError(_))));
    }

    #[test]
    fn test_parse_file_skips_lines_that_are_not_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bypass.conf");
        fs::write(
            &path,
            b"# r\xe8gles locales\n10.0.0.0/8 direct\nbad\xff.test block\nads.test block\n",
        )
        .unwrap();

        let rules = parse_rules_from_file(&path).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!((rules[0].pattern.as_str(), rules[0].line_num), ("10.0.0.0/8", 2));
        assert_eq!((rules[1].pattern.as_str(), rules[1].line_num), ("ads.test", 4));
        assert_eq!(rules[1].mark, Mark::Block);
    }

    #[test]
    fn test_ensure_rules_file_writes_bundled_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/bypass.conf");

        ensure_rules_file(&path, None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DEFAULT_RULES);
    }

    #[test]
    fn test_ensure_rules_file_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bypass.conf");
        fs::write(&path, "example.com proxy\n").unwrap();

        ensure_rules_file(&path, None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "example.com proxy\n");
    }

    #[test]
    fn test_ensure_rules_file_falls_back_when_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bypass.conf");

        // Nothing listens on port 9 of the loopback.
        ensure_rules_file(&path, Some("http://127.0.0.1:9/bypass.conf")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DEFAULT_RULES);
        assert!(!path.with_extension("tmp").exists());
    }
}
