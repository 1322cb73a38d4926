use std::time::Duration;

use conveyor_errors::{EngineError, EngineResult};

/// 解析形如 "300ms"、"10s"、"5m"、"2h" 的时长字符串
///
/// 支持复合写法（"1h30m"），单位为 ms / s / m / h。
pub fn parse_duration(value: &str) -> EngineResult<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::validation("时长不能为空"));
    }

    let mut total = Duration::ZERO;
    let mut chars = value.chars().peekable();

    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                number.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if number.is_empty() {
            return Err(EngineError::validation(format!("无效的时长: {value}")));
        }
        let amount: f64 = number
            .parse()
            .map_err(|_| EngineError::validation(format!("无效的时长: {value}")))?;
        let millis = match unit.as_str() {
            "ms" => amount,
            "s" | "" => amount * 1000.0,
            "m" => amount * 60_000.0,
            "h" => amount * 3_600_000.0,
            _ => {
                return Err(EngineError::validation(format!(
                    "不支持的时长单位: {unit}"
                )))
            }
        };
        total += Duration::from_millis(millis as u64);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            parse_duration("1m30s").unwrap(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_bare_number_means_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_fractional() {
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }
}
