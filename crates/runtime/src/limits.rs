//! 资源限额解析
//!
//! CPU 限额接受有理数（小数或分数），乘以 1e9 换算为纳核；乘积
//! 不是整数时拒绝。内存限额接受人类可读字节串，倍数为 1024。

use conveyor_errors::{EngineError, EngineResult};

const NANO: i64 = 1_000_000_000;

/// 解析 CPU 限额为纳核数
///
/// `"1.5"` -> 1_500_000_000，`"3/2"` -> 1_500_000_000。
pub fn parse_cpus(value: &str) -> EngineResult<i64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }

    if let Some((numer, denom)) = value.split_once('/') {
        let numer: i64 = numer
            .trim()
            .parse()
            .map_err(|_| EngineError::validation(format!("无法解析 CPU 限额: {value}")))?;
        let denom: i64 = denom
            .trim()
            .parse()
            .map_err(|_| EngineError::validation(format!("无法解析 CPU 限额: {value}")))?;
        if denom <= 0 || numer < 0 {
            return Err(EngineError::validation(format!(
                "无法解析 CPU 限额: {value}"
            )));
        }
        let scaled = numer
            .checked_mul(NANO)
            .ok_or_else(|| EngineError::validation(format!("CPU 限额溢出: {value}")))?;
        if scaled % denom != 0 {
            return Err(EngineError::validation("CPU 限额数值过于精确"));
        }
        return Ok(scaled / denom);
    }

    let (int_part, frac_part) = match value.split_once('.') {
        Some((i, f)) => (i, f),
        None => (value, ""),
    };
    let int_part: i64 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| EngineError::validation(format!("无法解析 CPU 限额: {value}")))?
    };
    if int_part < 0 {
        return Err(EngineError::validation(format!(
            "无法解析 CPU 限额: {value}"
        )));
    }
    if frac_part.len() > 9 {
        let (kept, dropped) = frac_part.split_at(9);
        if dropped.chars().any(|c| c != '0') {
            return Err(EngineError::validation("CPU 限额数值过于精确"));
        }
        return scaled_nanos(value, int_part, kept);
    }
    scaled_nanos(value, int_part, frac_part)
}

fn scaled_nanos(value: &str, int_part: i64, frac_part: &str) -> EngineResult<i64> {
    let frac: i64 = if frac_part.is_empty() {
        0
    } else {
        let padded = format!("{frac_part:0<9}");
        padded
            .parse()
            .map_err(|_| EngineError::validation(format!("无法解析 CPU 限额: {value}")))?
    };
    int_part
        .checked_mul(NANO)
        .and_then(|n| n.checked_add(frac))
        .ok_or_else(|| EngineError::validation(format!("CPU 限额溢出: {value}")))
}

/// 解析内存限额为字节数
///
/// 接受 `"1024"`、`"1k"`、`"512m"`、`"2g"`、`"1gi"` 等形式，
/// 后缀大小写不敏感，倍数均为 1024 的幂。
pub fn parse_memory(value: &str) -> EngineResult<i64> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return Ok(0);
    }

    let digits_end = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(digits_end);
    let number: f64 = number
        .parse()
        .map_err(|_| EngineError::validation(format!("无法解析内存限额: {value}")))?;

    let multiplier: i64 = match suffix.trim() {
        "" | "b" => 1,
        "k" | "kb" | "ki" | "kib" => 1 << 10,
        "m" | "mb" | "mi" | "mib" => 1 << 20,
        "g" | "gb" | "gi" | "gib" => 1 << 30,
        "t" | "tb" | "ti" | "tib" => 1 << 40,
        other => {
            return Err(EngineError::validation(format!(
                "不支持的内存单位: {other}"
            )))
        }
    };

    Ok((number * multiplier as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpus_decimal() {
        assert_eq!(parse_cpus("1").unwrap(), 1_000_000_000);
        assert_eq!(parse_cpus("1.5").unwrap(), 1_500_000_000);
        assert_eq!(parse_cpus("0.25").unwrap(), 250_000_000);
        assert_eq!(parse_cpus("0.000000001").unwrap(), 1);
        assert_eq!(parse_cpus("").unwrap(), 0);
    }

    #[test]
    fn test_parse_cpus_fraction() {
        assert_eq!(parse_cpus("3/2").unwrap(), 1_500_000_000);
        assert_eq!(parse_cpus("1/4").unwrap(), 250_000_000);
    }

    #[test]
    fn test_parse_cpus_too_precise() {
        assert!(parse_cpus("0.0000000001").is_err());
        assert!(parse_cpus("1/3").is_err());
    }

    #[test]
    fn test_parse_cpus_rejects_garbage() {
        assert!(parse_cpus("lots").is_err());
        assert!(parse_cpus("-1").is_err());
        assert!(parse_cpus("1/0").is_err());
    }

    #[test]
    fn test_parse_memory_plain_bytes() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("1024b").unwrap(), 1024);
        assert_eq!(parse_memory("").unwrap(), 0);
    }

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse_memory("1k").unwrap(), 1024);
        assert_eq!(parse_memory("1ki").unwrap(), 1024);
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1.5g").unwrap(), 3 * 512 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_case_insensitive() {
        assert_eq!(parse_memory("1G").unwrap(), parse_memory("1g").unwrap());
        assert_eq!(parse_memory("512M").unwrap(), parse_memory("512m").unwrap());
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("1x").is_err());
    }
}
