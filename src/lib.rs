#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod challenge;
pub mod client;
pub mod combinations;
pub mod config;
pub mod error;
pub mod http;
pub mod key;
pub mod knock;
pub mod listener;
pub mod marker;
pub mod metrics;
pub mod query;
pub mod resolver;
pub mod server;
pub mod session;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::challenge::Issuer;
    use crate::combinations::Combinations;
    use crate::key;
    use crate::knock::KnockAccumulator;
    use crate::session::SessionStore;

    #[test]
    fn test_key_encode_decode() {
        let key = key::encode(1, &[2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(key, 0x0102030405060708);
        assert_eq!(key::decode(1, key), vec![2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_generator_exhausts() {
        let generator = Combinations::new(vec![0, 1, 2, 3], 2);
        assert_eq!((0..6).filter_map(|_| generator.next()).count(), 6);
        assert!(generator.next().is_none());
    }

    #[test]
    fn test_session_round_trip() {
        let store = SessionStore::new(21380, Duration::from_secs(10));
        let issuer = Issuer::new(Combinations::new((21380..21390).collect(), 5), 3, 0);
        let challenge = issuer.issue(&store);

        let session = store.match_session(&challenge.tuples).expect("session");
        assert_eq!(session.tuples, challenge.tuples);
        assert!(store.remove_session(session.id).expect("removal").is_complete());
        assert!(store.find_sessions(&challenge.tuples).is_empty());
    }

    #[test]
    fn test_accumulator_feeds_store() {
        let store = SessionStore::new(21380, Duration::from_secs(10));
        let issuer = Issuer::new(Combinations::new((21380..21388).collect(), 4), 1, 0);
        let challenge = issuer.issue(&store);

        let acc = KnockAccumulator::new(4, 0, Duration::from_secs(1));
        let mut batch = None;
        for &port in &challenge.tuples[0] {
            batch = acc.knock(4242, port);
        }
        let batch = batch.expect("complete batch");
        let tuples: Vec<_> = batch.ports.chunks(4).map(|c| c.to_vec()).collect();
        assert_eq!(store.match_session(&tuples).expect("match").id, challenge.id);
    }
}
