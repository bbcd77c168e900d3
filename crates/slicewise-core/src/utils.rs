//! 通用工具函数

use chrono::NaiveDate;

/// 解析DICOM日期 (YYYYMMDD)
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

/// 将可能带有多余空白或空值的字符串规整为 Option
pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().trim_end_matches('\0').trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 解析数值文本，允许前后空白
pub fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dicom_date() {
        assert_eq!(parse_dicom_date("20240229"), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert!(parse_dicom_date("20230229").is_none());
        assert!(parse_dicom_date("").is_none());
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some(" CT \0".to_string())), Some("CT".to_string()));
        assert_eq!(non_empty(Some("   ".to_string())), None);
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 12.5 "), Some(12.5));
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number("abc"), None);
    }
}
