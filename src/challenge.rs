//! Challenge issuance and its text rendering.

use rand::Rng;
use tracing::debug;

use crate::combinations::Combinations;
use crate::key::{Port, Tuple};
use crate::session::{SessionId, SessionStore};

/// Number of tuples per challenge for a given bind-failure `tolerance` percent.
///
/// Extra tuples let a client that failed to bind some local ports still knock
/// at least one complete tuple.
pub fn batch_tuple_count(tolerance: u32, tuple_size: usize) -> usize {
    if tolerance == 0 {
        return 1;
    }
    (tolerance as usize * tuple_size / 100 + 2).max(1)
}

/// Tuples handed to a client together with the session that owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Owning session
    pub id: SessionId,
    /// Tuples in knock order
    pub tuples: Vec<Tuple>,
}

impl Challenge {
    /// Text sent to the client.
    pub fn to_text(&self) -> String {
        tuples_to_text(&self.tuples)
    }
}

/// Draws tuples from the shared generator and registers them as sessions.
pub struct Issuer {
    generator: Combinations<Port>,
    tuples_per_challenge: usize,
    skip_probability: u32,
}

impl Issuer {
    /// Create an issuer of `tuples_per_challenge` tuples.
    ///
    /// With `skip_probability` percent chance a combination is drawn and thrown
    /// away, so a freed combination is not immediately handed out again.
    /// Values of 100 and above are clamped to 99.
    pub fn new(
        generator: Combinations<Port>,
        tuples_per_challenge: usize,
        skip_probability: u32,
    ) -> Self {
        Self {
            generator,
            tuples_per_challenge,
            skip_probability: skip_probability.min(99),
        }
    }

    /// Draw the tuples for one challenge.
    pub fn next_tuples(&self) -> Vec<Tuple> {
        let mut rng = rand::thread_rng();
        let mut tuples = Vec::with_capacity(self.tuples_per_challenge);
        while tuples.len() < self.tuples_per_challenge {
            let Some(tuple) = self.generator.next_wrap() else {
                break;
            };
            if self.skip_probability > 0 && rng.gen_range(0..100) < self.skip_probability {
                debug!(?tuple, "skipping combination");
                continue;
            }
            tuples.push(tuple);
        }
        tuples
    }

    /// Draw tuples and register them in `store`.
    pub fn issue(&self, store: &SessionStore) -> Challenge {
        let tuples = self.next_tuples();
        let id = store.create_session(tuples.clone());
        Challenge { id, tuples }
    }
}

/// Render tuples one per line, ports separated by commas.
pub fn tuples_to_text(tuples: &[Tuple]) -> String {
    tuples
        .iter()
        .map(|tuple| {
            let ports: Vec<String> = tuple.iter().map(|p| p.to_string()).collect();
            ports.join(",") + "\n"
        })
        .collect()
}

/// Parse challenge text back into tuples.
///
/// Unparsable fields and empty lines are skipped.
pub fn parse_tuples_text(text: &str) -> Vec<Tuple> {
    text.lines()
        .map(|line| {
            line.split(',')
                .filter_map(|field| field.trim().parse::<Port>().ok())
                .collect::<Tuple>()
        })
        .filter(|tuple| !tuple.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tuple_count_follows_tolerance() {
        assert_eq!(batch_tuple_count(0, 5), 1);
        assert_eq!(batch_tuple_count(20, 5), 3);
        assert_eq!(batch_tuple_count(1, 4), 2);
        assert_eq!(batch_tuple_count(100, 4), 6);
    }

    #[test]
    fn first_tuples_render_in_order() {
        let issuer = Issuer::new(Combinations::new(vec![0, 1, 2, 3], 2), 2, 0);
        assert_eq!(tuples_to_text(&issuer.next_tuples()), "0,1\n0,2\n");
    }

    #[test]
    fn skipping_still_fills_challenge() {
        let issuer = Issuer::new(Combinations::new((0..6).collect(), 3), 4, 50);
        for _ in 0..20 {
            assert_eq!(issuer.next_tuples().len(), 4);
        }
    }

    #[test]
    fn invalid_generator_yields_empty_challenge() {
        let issuer = Issuer::new(Combinations::new(vec![1, 2], 3), 2, 0);
        assert!(issuer.next_tuples().is_empty());
    }

    #[test]
    fn issue_registers_session() {
        let store = SessionStore::new(21380, Duration::from_secs(10));
        let issuer = Issuer::new(Combinations::new((21380..21390).collect(), 4), 2, 0);
        let challenge = issuer.issue(&store);
        assert_eq!(challenge.to_text(), "21380,21381,21382,21383\n21380,21381,21382,21384\n");
        assert_eq!(store.match_session(&challenge.tuples).unwrap().id, challenge.id);
    }

    #[test]
    fn parses_challenge_text() {
        assert_eq!(
            parse_tuples_text("0,1,2,3\n4,5,6,7\n"),
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]
        );
        assert_eq!(parse_tuples_text("1,x,2\n\n"), vec![vec![1, 2]]);
    }
}
