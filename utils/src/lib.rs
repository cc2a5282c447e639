use std::process::Command;

use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

pub fn rand_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn get_local_ip() -> Option<String> {
    let output = match Command::new("hostname").args(["-I"]).output() {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    let stdout = match String::from_utf8(output.stdout) {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    let ips: Vec<&str> = stdout.trim().split(' ').collect::<Vec<&str>>();
    let first = ips.first();
    match first {
        Some(first) => {
            if !first.is_empty() {
                Some(first.to_string())
            } else {
                None
            }
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_string_length_and_charset() {
        let s = rand_string(20);
        assert_eq!(20, s.len());
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(s.to_lowercase(), s);
    }

    #[test]
    fn uuid_is_unique() {
        assert_ne!(uuid(), uuid());
    }
}
