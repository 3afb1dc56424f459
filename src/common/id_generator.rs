//! Stateless id helpers.

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;

fn random_suffix(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// `PREFIX[-SCOPE]-yymmddHHMMSS-XXXX`
pub fn generate_id_with_prefix(prefix: &str, scope: Option<&str>, length: usize) -> String {
    let mut parts = vec![prefix.to_string()];
    if let Some(scope) = scope.filter(|s| !s.is_empty()) {
        parts.push(scope.to_string());
    }
    parts.push(Utc::now().format("%y%m%d%H%M%S").to_string());
    parts.push(random_suffix(length));
    parts.join("-")
}

/// `rrr-rrr-salt`: `parts` random numbers below 1000 followed by the salt. The
/// salt alone keeps ids from one generator distinct.
pub fn simple_id_generator(salt: u64, parts: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut id_parts: Vec<String> = (0..parts)
        .map(|_| rng.gen_range(0..1000u16).to_string())
        .collect();
    id_parts.push(salt.to_string());
    id_parts.join("-")
}

/// Trailing numeric segment of an id, if any.
pub fn extract_id_salt(id: &str) -> Option<u64> {
    id.rsplit('-').next().and_then(|last| last.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_id_shape() {
        let id = generate_id_with_prefix("job", Some("T1"), 4);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "job");
        assert_eq!(parts[1], "T1");
        assert_eq!(parts[2].len(), 12);
        assert_eq!(parts[3].len(), 4);
        assert!(parts[3].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_simple_id_ends_with_salt() {
        let id = simple_id_generator(7, 2);
        assert_eq!(id.split('-').count(), 3);
        assert_eq!(extract_id_salt(&id), Some(7));
        assert!(
            id.split('-')
                .take(2)
                .all(|part| part.parse::<u16>().is_ok_and(|n| n < 1000))
        );
    }

    #[test]
    fn test_extract_salt_without_number() {
        assert_eq!(extract_id_salt("child-abc"), None);
        assert_eq!(extract_id_salt("42"), Some(42));
    }
}
