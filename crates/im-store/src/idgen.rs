// Snowflake-style ID generator: 41 bits of millisecond timestamp, 10 bits of
// machine id, 12 bits of per-millisecond sequence. No crate in the corpus
// provides this (the Go original wraps `github.com/bwmarrin/snowflake`), so
// it's hand-rolled to the same bit layout rather than pulled in as a stub
// dependency.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const EPOCH_MS: i64 = 1_700_000_000_000;
const MACHINE_ID_BITS: i64 = 10;
const SEQUENCE_BITS: i64 = 12;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;
const MAX_MACHINE_ID: i64 = (1 << MACHINE_ID_BITS) - 1;

pub struct IdGenerator {
    machine_id: i64,
    state: Mutex<(i64, i64)>, // (last_timestamp_ms, sequence)
}

impl IdGenerator {
    pub fn new(machine_id: i64) -> Self {
        assert!(
            (0..=MAX_MACHINE_ID).contains(&machine_id),
            "machine_id must fit in {MACHINE_ID_BITS} bits"
        );
        Self {
            machine_id,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        let mut now = now_ms();
        if now == state.0 {
            state.1 = (state.1 + 1) & MAX_SEQUENCE;
            if state.1 == 0 {
                // Sequence exhausted for this millisecond; spin to the next one.
                while now <= state.0 {
                    now = now_ms();
                }
            }
        } else {
            state.1 = 0;
        }
        state.0 = now;
        ((now - EPOCH_MS) << (MACHINE_ID_BITS + SEQUENCE_BITS))
            | (self.machine_id << SEQUENCE_BITS)
            | state.1
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_strictly_increasing() {
        let gen = IdGenerator::new(1);
        let mut prev = gen.generate();
        for _ in 0..1000 {
            let next = gen.generate();
            assert!(next > prev, "{next} should be greater than {prev}");
            prev = next;
        }
    }

    #[test]
    fn different_machines_never_collide_within_the_same_millisecond() {
        let a = IdGenerator::new(1);
        let b = IdGenerator::new(2);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            assert!(seen.insert(a.generate()));
            assert!(seen.insert(b.generate()));
        }
    }

    #[test]
    #[should_panic]
    fn rejects_out_of_range_machine_id() {
        IdGenerator::new(1 << MACHINE_ID_BITS);
    }
}
