use snowflake::SnowflakeIdBucket;
use std::sync::Mutex;

static ID_GENERATOR: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

/// Initialize the snowflake id generator for this process.
///
/// `machine_id` and `node_id` are 0-31. Call once at startup; callers that
/// skip initialization get a default (1, 1) bucket on first use.
pub fn init(machine_id: i32, node_id: i32) {
    let mut gen = ID_GENERATOR.lock().unwrap();
    *gen = Some(SnowflakeIdBucket::new(machine_id, node_id));
}

/// Produce the next opaque id as a string.
///
/// Execution-window generations use these: each restart gets a fresh id so
/// stale in-flight work can be detected by comparison and discarded.
pub fn next_id() -> String {
    let mut gen = ID_GENERATOR.lock().unwrap();
    let bucket = gen.get_or_insert_with(|| SnowflakeIdBucket::new(1, 1));
    bucket.get_id().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        init(1, 1);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = next_id();
            assert!(!id.is_empty());
            assert!(seen.insert(id), "duplicate id generated");
        }
    }

    #[test]
    fn ids_are_numeric_strings() {
        init(1, 1);
        assert!(next_id().parse::<i64>().is_ok());
    }
}
