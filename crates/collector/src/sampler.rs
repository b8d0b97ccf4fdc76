//! Deterministic sampling.
//!
//! The decision hashes the pair key for HTTP records and the stream id for
//! everything else, so both halves of a transaction always share one fate
//! and re-running a capture reproduces the same sample.

use records::{Content, Record};
use xxhash_rust::xxh3::xxh3_64;

use crate::Collector;

pub struct Sampler {
    rate: f64,
    next: Box<dyn Collector>,
}

impl Sampler {
    pub fn new(rate: f64, next: Box<dyn Collector>) -> Sampler {
        Sampler {
            rate: rate.clamp(0.0, 1.0),
            next,
        }
    }

    fn admit(&self, record: &Record) -> bool {
        let basis = match &record.content {
            Content::Request(req) => xxh3_64(&req.pair_key().to_string().into_bytes()),
            Content::Response(resp) => xxh3_64(&resp.pair_key().to_string().into_bytes()),
            other => xxh3_64(&other.stream().0.to_le_bytes()),
        };
        // Map the digest onto [0, 1) and compare against the rate.
        ((basis >> 11) as f64 / (1u64 << 53) as f64) < self.rate
    }
}

impl Collector for Sampler {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        if !self.admit(&record) {
            return Ok(());
        }
        self.next.process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.next.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{request_record, response_record, Remember};
    use records::Content;

    #[test]
    fn pair_halves_share_one_decision() {
        let seen = Remember::default();
        let mut sampler = Sampler::new(0.5, Box::new(seen.clone()));
        for stream in 0..200u64 {
            sampler.process(request_record(stream, 0, "/", "h")).unwrap();
            sampler.process(response_record(stream, 0, 200)).unwrap();
        }
        let records = seen.seen();
        // Every admitted request has its admitted response right behind it.
        assert!(records.len() % 2 == 0);
        for pair in records.chunks(2) {
            let req_key = match &pair[0].content {
                Content::Request(r) => r.pair_key(),
                other => panic!("expected request first: {:?}", other),
            };
            let resp_key = match &pair[1].content {
                Content::Response(r) => r.pair_key(),
                other => panic!("expected response second: {:?}", other),
            };
            assert_eq!(req_key, resp_key);
        }
    }

    #[test]
    fn rate_bounds_are_absolute() {
        let all = Remember::default();
        let mut keep_all = Sampler::new(1.0, Box::new(all.clone()));
        let none = Remember::default();
        let mut keep_none = Sampler::new(0.0, Box::new(none.clone()));
        for stream in 0..50u64 {
            keep_all.process(request_record(stream, 0, "/", "h")).unwrap();
            keep_none.process(request_record(stream, 0, "/", "h")).unwrap();
        }
        assert_eq!(50, all.seen().len());
        assert_eq!(0, none.seen().len());
    }

    #[test]
    fn sampling_fraction_is_roughly_honored() {
        let seen = Remember::default();
        let mut sampler = Sampler::new(0.3, Box::new(seen.clone()));
        for stream in 0..1000u64 {
            sampler.process(request_record(stream, 0, "/", "h")).unwrap();
        }
        let admitted = seen.seen().len();
        assert!((150..450).contains(&admitted), "admitted {}", admitted);
    }
}
