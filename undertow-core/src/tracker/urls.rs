//! Tiered announce URL list with sticky last-good promotion.

use url::Url;

/// Ordered tiers of announce URLs ("announce-list" semantics).
///
/// Within a tier URLs are tried in order; a successfully-contacted URL is
/// moved to the front of its tier and its tier to the front of the list,
/// so the last-good URL is always tried first. Mutated only by the owning
/// state machine after an attempt; the single-in-flight progress flag rules
/// out concurrent mutation.
#[derive(Debug, Clone, Default)]
pub struct TrackerUrlList {
    tiers: Vec<Vec<Url>>,
}

impl TrackerUrlList {
    /// Builds the list from announce-list tiers, dropping unparseable URLs.
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        let tiers = tiers
            .into_iter()
            .map(|tier| {
                tier.iter()
                    .filter_map(|raw| match Url::parse(raw) {
                        Ok(url) => Some(url),
                        Err(e) => {
                            tracing::warn!("Dropping unparseable announce URL {raw}: {e}");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|tier: &Vec<Url>| !tier.is_empty())
            .collect();
        Self { tiers }
    }

    /// Single-tier convenience constructor.
    pub fn single(url: &str) -> Self {
        Self::new(vec![vec![url.to_string()]])
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn tiers(&self) -> &[Vec<Url>] {
        &self.tiers
    }

    /// Snapshot of every URL in iteration order, tagged with its tier.
    pub fn flattened(&self) -> Vec<(usize, Url)> {
        self.tiers
            .iter()
            .enumerate()
            .flat_map(|(tier, urls)| urls.iter().map(move |u| (tier, u.clone())))
            .collect()
    }

    /// Promotes a successfully-contacted URL to the front of its tier and
    /// its tier to the front of the list.
    pub fn promote(&mut self, url: &Url) {
        let Some(tier_idx) = self
            .tiers
            .iter()
            .position(|tier| tier.iter().any(|u| u == url))
        else {
            return;
        };

        let tier = &mut self.tiers[tier_idx];
        let url_idx = tier.iter().position(|u| u == url).unwrap_or(0);
        let promoted = tier.remove(url_idx);
        tier.insert(0, promoted);

        let promoted_tier = self.tiers.remove(tier_idx);
        self.tiers.insert(0, promoted_tier);
    }

    /// Replaces a URL in place, preserving its position. Used when a tracker
    /// signals a permanent redirect.
    pub fn replace(&mut self, old: &Url, new: Url) -> bool {
        for tier in &mut self.tiers {
            if let Some(idx) = tier.iter().position(|u| u == old) {
                tier[idx] = new;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod url_list_tests {
    use super::*;

    fn list() -> TrackerUrlList {
        TrackerUrlList::new(vec![
            vec![
                "http://a.example/announce".to_string(),
                "http://b.example/announce".to_string(),
            ],
            vec!["udp://c.example:6969/announce".to_string()],
        ])
    }

    #[test]
    fn test_flattened_preserves_tier_order() {
        let urls = list().flattened();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0].0, 0);
        assert_eq!(urls[1].0, 0);
        assert_eq!(urls[2].0, 1);
        assert_eq!(urls[2].1.as_str(), "udp://c.example:6969/announce");
    }

    #[test]
    fn test_promote_moves_url_and_tier_to_front() {
        let mut urls = list();
        let target = Url::parse("udp://c.example:6969/announce").unwrap();
        urls.promote(&target);

        let flat = urls.flattened();
        assert_eq!(flat[0].1, target);
        assert_eq!(flat[0].0, 0);

        // Promotion is idempotent once at the front.
        urls.promote(&target);
        assert_eq!(urls.flattened()[0].1, target);
    }

    #[test]
    fn test_promote_within_tier() {
        let mut urls = list();
        let second = Url::parse("http://b.example/announce").unwrap();
        urls.promote(&second);
        let flat = urls.flattened();
        assert_eq!(flat[0].1, second);
        assert_eq!(flat[1].1.as_str(), "http://a.example/announce");
    }

    #[test]
    fn test_invalid_urls_are_dropped() {
        let urls = TrackerUrlList::new(vec![vec![
            "not a url".to_string(),
            "http://ok.example/announce".to_string(),
        ]]);
        assert_eq!(urls.flattened().len(), 1);
    }

    #[test]
    fn test_replace_for_permanent_redirect() {
        let mut urls = list();
        let old = Url::parse("http://a.example/announce").unwrap();
        let new = Url::parse("http://moved.example/announce").unwrap();
        assert!(urls.replace(&old, new.clone()));
        assert_eq!(urls.flattened()[0].1, new);
    }
}
