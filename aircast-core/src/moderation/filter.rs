use regex::Regex;

use crate::config::ModerationSection;
use crate::reputation::ViolationSeverity;

use super::ModerationError;

/// A local-filter hit. `rule` names the offending term or pattern so the
/// audit log can reproduce the decision.
#[derive(Debug, Clone)]
pub struct FilterMatch {
    pub rule: String,
    pub severity: ViolationSeverity,
}

/// Deterministic first stage of the pipeline: exact blocked terms plus
/// compiled patterns. Cheap enough to run on every submission, and expected
/// to catch the bulk of obviously-bad input before the external call.
#[derive(Debug, Clone)]
pub struct LocalFilter {
    terms: Vec<String>,
    patterns: Vec<(String, Regex)>,
}

impl LocalFilter {
    pub fn from_config(config: &ModerationSection) -> Result<Self, ModerationError> {
        let terms = config
            .blocked_terms
            .iter()
            .map(|term| term.to_lowercase())
            .collect();
        let mut patterns = Vec::with_capacity(config.blocked_patterns.len());
        for pattern in &config.blocked_patterns {
            let compiled = Regex::new(pattern).map_err(|source| ModerationError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            patterns.push((pattern.clone(), compiled));
        }
        Ok(Self { terms, patterns })
    }

    pub fn check(&self, prompt: &str) -> Option<FilterMatch> {
        let lowered = prompt.to_lowercase();
        for term in &self.terms {
            if lowered.contains(term.as_str()) {
                return Some(FilterMatch {
                    rule: format!("term:{term}"),
                    severity: ViolationSeverity::High,
                });
            }
        }
        for (raw, pattern) in &self.patterns {
            if pattern.is_match(prompt) {
                return Some(FilterMatch {
                    rule: format!("pattern:{raw}"),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(terms: &[&str], patterns: &[&str]) -> LocalFilter {
        let config = ModerationSection {
            blocked_terms: terms.iter().map(|t| t.to_string()).collect(),
            blocked_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            classifier_endpoint: String::new(),
            classifier_timeout_ms: 1000,
            flag_margin: 0.15,
            relaxed_threshold: 0.85,
            standard_threshold: 0.70,
            strict_threshold: 0.50,
        };
        LocalFilter::from_config(&config).unwrap()
    }

    #[test]
    fn matches_blocked_term_case_insensitively() {
        let filter = filter(&["doxx"], &[]);
        let hit = filter.check("please DoXX this person").unwrap();
        assert_eq!(hit.rule, "term:doxx");
        assert_eq!(hit.severity, ViolationSeverity::High);
    }

    #[test]
    fn matches_pattern_with_critical_severity() {
        let filter = filter(&[], &["(?i)\\bk[i1]ll\\b"]);
        let hit = filter.check("k1ll the lights").unwrap();
        assert_eq!(hit.severity, ViolationSeverity::Critical);
    }

    #[test]
    fn clean_prompt_passes() {
        let filter = filter(&["doxx"], &["(?i)\\bbadword\\b"]);
        assert!(filter.check("a mellow jazz tune about rain").is_none());
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let config = ModerationSection {
            blocked_terms: vec![],
            blocked_patterns: vec!["([unclosed".to_string()],
            classifier_endpoint: String::new(),
            classifier_timeout_ms: 1000,
            flag_margin: 0.15,
            relaxed_threshold: 0.85,
            standard_threshold: 0.70,
            strict_threshold: 0.50,
        };
        assert!(LocalFilter::from_config(&config).is_err());
    }
}
