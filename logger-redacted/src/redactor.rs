use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
    // Brazilian numbers with area code in parentheses: (11) 91234-5678, +55 (21) 3456-7890
    static ref PHONE_REGEX: Regex =
        Regex::new(r"(?:\+55\s?)?\(\d{2}\)\s?9?\d{4}-?\d{4}\b").unwrap();
    static ref CPF_REGEX: Regex = Regex::new(r"\b\d{3}\.\d{3}\.\d{3}-\d{2}\b").unwrap();
    static ref IP_REGEX: Regex = Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").unwrap();
}

/// PII redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_cpf: bool,
    pub redact_ip_addresses: bool,
    pub hash_for_correlation: bool,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_emails: true,
            redact_phones: true,
            redact_cpf: true,
            redact_ip_addresses: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

impl RedactionConfig {
    /// Configuration that leaves text untouched
    pub fn disabled() -> Self {
        Self {
            redact_emails: false,
            redact_phones: false,
            redact_cpf: false,
            redact_ip_addresses: false,
            hash_for_correlation: false,
            custom_patterns: Vec::new(),
        }
    }

    pub fn with_custom_pattern(mut self, pattern: Regex, replacement: impl Into<String>) -> Self {
        self.custom_patterns.push((pattern, replacement.into()));
        self
    }
}

/// PII redactor for log messages
#[derive(Debug)]
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.config.redact_emails {
            result = self.redact_emails(&result);
        }

        if self.config.redact_cpf {
            result = self.redact_cpf(&result);
        }

        if self.config.redact_phones {
            result = self.redact_phones(&result);
        }

        if self.config.redact_ip_addresses {
            result = self.redact_ip_addresses(&result);
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }

        result
    }

    fn redact_emails(&self, text: &str) -> String {
        EMAIL_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                let email = &caps[0];
                if self.config.hash_for_correlation {
                    format!("EMAIL[{}]", self.hash_value(email))
                } else {
                    match email.split_once('@') {
                        Some((local, domain)) => format!(
                            "{}***@{}***",
                            local.chars().next().unwrap_or('*'),
                            domain.chars().next().unwrap_or('*')
                        ),
                        None => "***@***".to_string(),
                    }
                }
            })
            .to_string()
    }

    fn redact_phones(&self, text: &str) -> String {
        PHONE_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                if self.config.hash_for_correlation {
                    format!("PHONE[{}]", self.hash_value(&caps[0]))
                } else {
                    "(**) *****-****".to_string()
                }
            })
            .to_string()
    }

    fn redact_cpf(&self, text: &str) -> String {
        CPF_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                if self.config.hash_for_correlation {
                    format!("CPF[{}]", self.hash_value(&caps[0]))
                } else {
                    "***.***.***-**".to_string()
                }
            })
            .to_string()
    }

    fn redact_ip_addresses(&self, text: &str) -> String {
        IP_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                if self.config.hash_for_correlation {
                    format!("IP[{}]", self.hash_value(&caps[0]))
                } else {
                    let parts: Vec<&str> = caps[0].split('.').collect();
                    match (parts.first(), parts.last()) {
                        (Some(first), Some(last)) if parts.len() == 4 => {
                            format!("{}.***.***.{}", first, last)
                        }
                        _ => "***.***.***.***".to_string(),
                    }
                }
            })
            .to_string()
    }

    fn hash_value(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        let result = hasher.finalize();
        general_purpose::STANDARD.encode(&result[..8]) // Use first 8 bytes for shorter hash
    }
}
