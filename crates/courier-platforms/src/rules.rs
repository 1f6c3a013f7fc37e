//! Per-platform content rules.

use std::sync::LazyLock;

use courier_store::{MediaRef, Platform};
use regex::Regex;

use crate::adapter::{Optimized, Rendered};
use crate::error::PolicyViolation;

static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\p{L}\p{N}_&])#([\p{L}\p{N}_]+)").unwrap());

static INLINE_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());

static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Hard limits a platform enforces on a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformRules {
    pub platform: Platform,
    pub max_chars: usize,
    pub max_media: usize,
    pub media_required: bool,
    /// `None` when the platform sets no hashtag limit.
    pub max_hashtags: Option<usize>,
    /// Exceeding a soft hashtag limit warns instead of failing.
    pub hashtag_limit_soft: bool,
}

const TWITTER: PlatformRules = PlatformRules {
    platform: Platform::Twitter,
    max_chars: 280,
    max_media: 4,
    media_required: false,
    max_hashtags: Some(3),
    hashtag_limit_soft: true,
};

const INSTAGRAM: PlatformRules = PlatformRules {
    platform: Platform::Instagram,
    max_chars: 2200,
    max_media: 10,
    media_required: true,
    max_hashtags: Some(30),
    hashtag_limit_soft: false,
};

const LINKEDIN: PlatformRules = PlatformRules {
    platform: Platform::Linkedin,
    max_chars: 3000,
    max_media: 9,
    media_required: false,
    max_hashtags: None,
    hashtag_limit_soft: false,
};

const FACEBOOK: PlatformRules = PlatformRules {
    platform: Platform::Facebook,
    max_chars: 63206,
    max_media: 10,
    media_required: false,
    max_hashtags: None,
    hashtag_limit_soft: false,
};

impl PlatformRules {
    /// The rule book entry for `platform`.
    pub const fn for_platform(platform: Platform) -> &'static PlatformRules {
        match platform {
            Platform::Twitter => &TWITTER,
            Platform::Instagram => &INSTAGRAM,
            Platform::Linkedin => &LINKEDIN,
            Platform::Facebook => &FACEBOOK,
        }
    }

    /// Render `base` for this platform and report what validation would say.
    ///
    /// Whitespace is normalized and hashtags are extracted. Content is never
    /// truncated; an over-long post is reported as a warning and `valid = false`.
    pub fn optimize(&self, base: &str, media: &[MediaRef]) -> Optimized {
        let content = normalize_whitespace(base);
        let hashtags = extract_hashtags(&content);

        let rendered = Rendered {
            content,
            media_refs: media.to_vec(),
            hashtags,
        };

        let mut warnings = Vec::new();
        let soft_limit = self.max_hashtags.filter(|_| self.hashtag_limit_soft);
        if let Some(max) = soft_limit.filter(|&max| rendered.hashtags.len() > max) {
            warnings.push(format!(
                "{} hashtags; {} recommends at most {}",
                rendered.hashtags.len(),
                self.platform,
                max
            ));
        }
        let valid = match self.validate(&rendered) {
            Ok(()) => true,
            Err(violation) => {
                warnings.push(violation.to_string());
                false
            }
        };

        Optimized {
            content: rendered.content,
            hashtags: rendered.hashtags,
            warnings,
            valid,
        }
    }

    /// Check the hard constraints.
    pub fn validate(&self, rendered: &Rendered) -> Result<(), PolicyViolation> {
        let len = rendered.content.chars().count();
        if len > self.max_chars {
            return Err(PolicyViolation::ContentTooLong {
                len,
                max: self.max_chars,
            });
        }

        let count = rendered.media_refs.len();
        if count > self.max_media {
            return Err(PolicyViolation::TooManyMedia {
                count,
                max: self.max_media,
            });
        }
        if self.media_required && count == 0 {
            return Err(PolicyViolation::MediaRequired);
        }

        if let Some(max) = self.max_hashtags {
            let count = rendered.hashtags.len();
            if count > max && !self.hashtag_limit_soft {
                return Err(PolicyViolation::TooManyHashtags { count, max });
            }
        }

        Ok(())
    }
}

/// Collapse inline whitespace runs, trim line ends, and cap blank lines at one.
pub fn normalize_whitespace(text: &str) -> String {
    let lines: Vec<String> = text
        .replace("\r\n", "\n")
        .lines()
        .map(|line| INLINE_SPACE_RE.replace_all(line.trim(), " ").into_owned())
        .collect();
    BLANK_LINES_RE
        .replace_all(lines.join("\n").trim(), "\n\n")
        .into_owned()
}

/// Hashtags in order of first appearance, without the `#`, deduplicated
/// case-insensitively.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    let mut tags = Vec::new();
    for cap in HASHTAG_RE.captures_iter(text) {
        let tag = &cap[1];
        let key = tag.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            tags.push(tag.to_string());
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn rendered(content: &str, media: usize) -> Rendered {
        Rendered {
            content: content.to_string(),
            media_refs: (0..media).map(|i| MediaRef::new(format!("m{}", i))).collect(),
            hashtags: extract_hashtags(content),
        }
    }

    #[test_case(Platform::Twitter, 280, 4, false, Some(3) ; "twitter")]
    #[test_case(Platform::Instagram, 2200, 10, true, Some(30) ; "instagram")]
    #[test_case(Platform::Linkedin, 3000, 9, false, None ; "linkedin")]
    #[test_case(Platform::Facebook, 63206, 10, false, None ; "facebook")]
    fn test_rule_book(
        platform: Platform,
        max_chars: usize,
        max_media: usize,
        media_required: bool,
        max_hashtags: Option<usize>,
    ) {
        let rules = PlatformRules::for_platform(platform);
        assert_eq!(rules.platform, platform);
        assert_eq!(rules.max_chars, max_chars);
        assert_eq!(rules.max_media, max_media);
        assert_eq!(rules.media_required, media_required);
        assert_eq!(rules.max_hashtags, max_hashtags);
    }

    #[test_case(Platform::Twitter, 280 ; "twitter")]
    #[test_case(Platform::Instagram, 2200 ; "instagram")]
    #[test_case(Platform::Linkedin, 3000 ; "linkedin")]
    #[test_case(Platform::Facebook, 63206 ; "facebook")]
    fn test_length_boundary(platform: Platform, max: usize) {
        let rules = PlatformRules::for_platform(platform);
        assert!(rules.validate(&rendered(&"a".repeat(max), 1)).is_ok());
        assert_eq!(
            rules.validate(&rendered(&"a".repeat(max + 1), 1)),
            Err(PolicyViolation::ContentTooLong { len: max + 1, max })
        );
    }

    #[test_case(Platform::Twitter, 4 ; "twitter")]
    #[test_case(Platform::Instagram, 10 ; "instagram")]
    #[test_case(Platform::Linkedin, 9 ; "linkedin")]
    #[test_case(Platform::Facebook, 10 ; "facebook")]
    fn test_media_boundary(platform: Platform, max: usize) {
        let rules = PlatformRules::for_platform(platform);
        assert!(rules.validate(&rendered("hi", max)).is_ok());
        assert_eq!(
            rules.validate(&rendered("hi", max + 1)),
            Err(PolicyViolation::TooManyMedia {
                count: max + 1,
                max
            })
        );
    }

    #[test]
    fn test_instagram_requires_media() {
        let rules = PlatformRules::for_platform(Platform::Instagram);
        let violation = rules.validate(&rendered("hello world", 0)).unwrap_err();
        assert_eq!(violation, PolicyViolation::MediaRequired);
        assert_eq!(violation.reason(), "media_required");
    }

    #[test]
    fn test_twitter_hashtag_limit_is_soft() {
        let rules = PlatformRules::for_platform(Platform::Twitter);
        let optimized = rules.optimize("launch #one #two #three #four", &[]);
        assert!(optimized.valid);
        assert_eq!(optimized.hashtags.len(), 4);
        assert_eq!(optimized.warnings.len(), 1);
    }

    #[test]
    fn test_instagram_hashtag_limit_is_hard() {
        let rules = PlatformRules::for_platform(Platform::Instagram);
        let tags: Vec<String> = (0..31).map(|i| format!("#tag{}", i)).collect();
        let violation = rules
            .validate(&rendered(&tags.join(" "), 1))
            .unwrap_err();
        assert_eq!(
            violation,
            PolicyViolation::TooManyHashtags { count: 31, max: 30 }
        );
    }

    #[test]
    fn test_optimize_does_not_truncate() {
        let rules = PlatformRules::for_platform(Platform::Twitter);
        let long = "word ".repeat(100);
        let optimized = rules.optimize(&long, &[]);
        assert!(!optimized.valid);
        assert_eq!(optimized.content, long.trim());
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(
            normalize_whitespace("  hello \t  world  \r\n\n\n\nbye  "),
            "hello world\n\nbye"
        );
    }

    #[test]
    fn test_extract_hashtags() {
        assert_eq!(
            extract_hashtags("#Rust and #rust, plus #async_io. Not a&#39;tag or mail#tag"),
            vec!["Rust".to_string(), "async_io".to_string()]
        );
    }
}
