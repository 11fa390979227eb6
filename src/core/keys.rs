//! API Key 解析：单个 Key 或以逗号/换行分隔的 Key 池，按策略取用

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::Deserialize;

use crate::core::GatewayError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    First,
    Random,
    RoundRobin,
}

#[derive(Debug, Default)]
pub struct KeyResolver {
    keys: Vec<String>,
    strategy: KeyStrategy,
    cursor: AtomicUsize,
}

impl KeyResolver {
    pub fn from_pool(pool: &str, strategy: KeyStrategy) -> Self {
        let keys = pool
            .split([',', '\n'])
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            keys,
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// 取一个 Key；池为空时返回 NoApiKey
    pub fn resolve(&self) -> Result<String, GatewayError> {
        if self.keys.is_empty() {
            return Err(GatewayError::NoApiKey);
        }
        let idx = match self.strategy {
            KeyStrategy::First => 0,
            KeyStrategy::Random => rand::thread_rng().gen_range(0..self.keys.len()),
            KeyStrategy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len(),
        };
        Ok(self.keys[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_parsing() {
        let resolver = KeyResolver::from_pool(" k1, k2\nk3\n\n,", KeyStrategy::First);
        assert_eq!(resolver.len(), 3);
        assert_eq!(resolver.resolve().unwrap(), "k1");
    }

    #[test]
    fn test_round_robin() {
        let resolver = KeyResolver::from_pool("a,b", KeyStrategy::RoundRobin);
        let picks: Vec<String> = (0..4).map(|_| resolver.resolve().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_random_stays_in_pool() {
        let resolver = KeyResolver::from_pool("a,b,c", KeyStrategy::Random);
        for _ in 0..20 {
            assert!(["a", "b", "c"].contains(&resolver.resolve().unwrap().as_str()));
        }
    }

    #[test]
    fn test_empty_pool() {
        let resolver = KeyResolver::from_pool(" , \n", KeyStrategy::Random);
        assert!(matches!(resolver.resolve(), Err(GatewayError::NoApiKey)));
    }
}
