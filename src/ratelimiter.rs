use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Fenêtre glissante d'une minute par adresse IP (le port source change à
/// chaque connexion, il ne compte pas).
pub struct RateLimiter {
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    max_per_minute: usize,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_per_minute,
        }
    }

    pub fn check_and_add(&mut self, addr: IpAddr) -> bool {
        self.check_and_add_at(addr, Instant::now())
    }

    fn check_and_add_at(&mut self, addr: IpAddr, now: Instant) -> bool {
        // Purger les adresses inactives pour borner la table
        self.connections.retain(|_, entries| {
            entries.back().map_or(false, |&last| now.duration_since(last) <= WINDOW)
        });

        let entries = self.connections.entry(addr).or_default();

        // Nettoyer les entrées plus vieilles qu'une minute
        while let Some(&time) = entries.front() {
            if now.duration_since(time) > WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.max_per_minute {
            false
        } else {
            entries.push_back(now);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_per_ip() {
        let mut limiter = RateLimiter::new(2);
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();
        let now = Instant::now();

        assert!(limiter.check_and_add_at(a, now));
        assert!(limiter.check_and_add_at(a, now));
        assert!(!limiter.check_and_add_at(a, now));
        assert!(limiter.check_and_add_at(b, now));
    }

    #[test]
    fn window_slides() {
        let mut limiter = RateLimiter::new(1);
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let start = Instant::now();

        assert!(limiter.check_and_add_at(a, start));
        assert!(!limiter.check_and_add_at(a, start + Duration::from_secs(30)));
        assert!(limiter.check_and_add_at(a, start + Duration::from_secs(61)));
    }

    #[test]
    fn idle_addresses_are_purged() {
        let mut limiter = RateLimiter::new(5);
        let start = Instant::now();
        for i in 1..=10u8 {
            limiter.check_and_add_at(IpAddr::from([198, 51, 100, i]), start);
        }
        assert_eq!(limiter.connections.len(), 10);

        limiter.check_and_add_at("203.0.113.1".parse().unwrap(), start + Duration::from_secs(120));
        assert_eq!(limiter.connections.len(), 1);
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let mut limiter = RateLimiter::new(0);
        assert!(!limiter.check_and_add("192.0.2.1".parse().unwrap()));
    }
}
