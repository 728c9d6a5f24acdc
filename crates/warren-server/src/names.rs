//! Random hostname generation and host validation policy.
//!
//! Generated names are `<word>.<domain>` with both parts drawn uniformly
//! from configured lists; the word list ships embedded. Validators are
//! composable predicates over candidate hostnames, combined by the serve
//! command into the site policy.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

/// Embedded word list for generated hostnames.
const EMBEDDED_WORDS: &str = include_str!("animals.txt");

/// A predicate deciding whether a client-requested hostname is acceptable.
pub type HostValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Generates fresh random hostnames. Pure; does no I/O and holds no state
/// beyond its configured lists.
#[derive(Debug, Clone)]
pub struct NameProvider {
    words: Vec<String>,
    domains: Vec<String>,
}

impl NameProvider {
    pub fn new(words: Vec<String>, domains: Vec<String>) -> Self {
        Self { words, domains }
    }

    /// Provider backed by the embedded word list, generating names under the
    /// given domains (bare words when no domains are configured).
    pub fn embedded(domains: Vec<String>) -> Self {
        let words = EMBEDDED_WORDS
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self::new(words, domains)
    }

    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let word = match self.words.choose(&mut rng) {
            Some(word) => word.clone(),
            // Empty word list: still produce something routable.
            None => format!("tunnel-{:06x}", rng.gen::<u32>() & 0xff_ffff),
        };
        match self.domains.choose(&mut rng) {
            Some(domain) => format!("{word}.{domain}"),
            None => word,
        }
    }

    /// The word list, for building the deny-prefix policy that keeps the
    /// random pool unclaimable.
    pub fn words(&self) -> &[String] {
        &self.words
    }
}

/// Refuse every custom hostname; the default when no domain policy is
/// configured, forcing clients onto generated names.
pub fn deny_all() -> HostValidator {
    Arc::new(|_| false)
}

/// Reject any hostname whose label before the first dot is in `prefixes`.
pub fn deny_prefix_in(prefixes: Vec<String>) -> HostValidator {
    Arc::new(move |host| {
        let prefix = match host.find('.') {
            Some(idx) => &host[..idx],
            None => host,
        };
        !prefixes.iter().any(|denied| denied == prefix)
    })
}

/// Accept only hostnames ending in `.<d>` for some `d` in `suffixes`.
pub fn suffix_in(suffixes: Vec<String>) -> HostValidator {
    Arc::new(move |host| {
        suffixes
            .iter()
            .any(|suffix| host.ends_with(&format!(".{suffix}")))
    })
}

/// Logical AND of validators.
pub fn validate_all(validators: Vec<HostValidator>) -> HostValidator {
    Arc::new(move |host| validators.iter().all(|validator| validator(host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_word_list_is_usable() {
        let provider = NameProvider::embedded(vec!["example.com".into()]);
        assert!(!provider.words().is_empty());

        let name = provider.generate();
        assert!(name.ends_with(".example.com"));
        let word = name.strip_suffix(".example.com").unwrap();
        assert!(provider.words().iter().any(|w| w == word));
    }

    #[test]
    fn generate_without_domains_yields_bare_word() {
        let provider = NameProvider::new(vec!["otter".into()], vec![]);
        assert_eq!(provider.generate(), "otter");
    }

    #[test]
    fn generate_draws_from_all_domains() {
        let provider = NameProvider::new(
            vec!["otter".into()],
            vec!["a.example".into(), "b.example".into()],
        );
        let mut seen_a = false;
        let mut seen_b = false;
        for _ in 0..200 {
            match provider.generate().as_str() {
                "otter.a.example" => seen_a = true,
                "otter.b.example" => seen_b = true,
                other => panic!("unexpected name {other}"),
            }
        }
        assert!(seen_a && seen_b);
    }

    #[test]
    fn deny_all_rejects_everything() {
        let validator = deny_all();
        assert!(!validator("anything.example.com"));
    }

    #[test]
    fn deny_prefix_matches_first_label_only() {
        let validator = deny_prefix_in(vec!["otter".into(), "heron".into()]);
        assert!(!validator("otter.example.com"));
        assert!(!validator("heron"));
        assert!(validator("myapp.example.com"));
        // Denied word in a later label is fine.
        assert!(validator("app.otter.example.com"));
    }

    #[test]
    fn suffix_accepts_listed_domains_only() {
        let validator = suffix_in(vec!["example.com".into(), "example.net".into()]);
        assert!(validator("myapp.example.com"));
        assert!(validator("deep.sub.example.net"));
        assert!(!validator("example.com"));
        assert!(!validator("myapp.example.org"));
        assert!(!validator("notexample.com"));
    }

    #[test]
    fn validate_all_is_conjunction() {
        let validator = validate_all(vec![
            deny_prefix_in(vec!["otter".into()]),
            suffix_in(vec!["example.com".into()]),
        ]);
        assert!(validator("myapp.example.com"));
        assert!(!validator("otter.example.com"));
        assert!(!validator("myapp.example.net"));
    }
}
