//! 通用工具函数

use chrono::{Datelike, Months, NaiveDate, Timelike, Utc};
use rand::Rng;

/// 替代标识符的合法年份范围，移位结果越界时回退为原值
const MIN_SHIFT_YEAR: i32 = 1900;
const MAX_SHIFT_YEAR: i32 = 2100;

/// 生成一个新的替代标识符
///
/// 格式为点分时间戳加六位随机后缀，全局唯一的概率足够高；
/// 同时兼做合法的DICOM UID片段。
pub fn generate_pseudo_id() -> String {
    let now = Utc::now();
    let random_suffix: u32 = rand::thread_rng().gen_range(100_000..=999_999);
    format!(
        "{}.{}.{}.{}.{}.{}.{}.{}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_micros(),
        random_suffix
    )
}

/// 生成本次去标识化运行的日期偏移量（天）
///
/// 每次运行只生成一次，对该次运行处理的所有文件统一生效，
/// 保持检查内部的相对时序。
pub fn generate_date_offset() -> i64 {
    rand::thread_rng().gen_range(-60..=60)
}

/// 校验DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty() && uid.len() <= 64 && uid.chars().all(|c| c.is_numeric() || c == '.')
}

/// 解析 YYYYMMDD 形式的DICOM日期
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

/// 输出 YYYYMMDD 形式的DICOM日期
pub fn format_dicom_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// 对日期应用偏移量
///
/// 偏移按整月加余数天拆分（30天折一个月），月份加法按日历处理
/// 月末边界。结果年份超出合理范围时返回原值。
pub fn shift_date(date: NaiveDate, offset_days: i64) -> NaiveDate {
    let months = offset_days / 30;
    let remaining_days = offset_days % 30;

    let shifted = if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new((-months) as u32))
    };

    let shifted = shifted.and_then(|d| {
        if remaining_days >= 0 {
            d.checked_add_days(chrono::Days::new(remaining_days as u64))
        } else {
            d.checked_sub_days(chrono::Days::new((-remaining_days) as u64))
        }
    });

    match shifted {
        Some(d) if (MIN_SHIFT_YEAR..=MAX_SHIFT_YEAR).contains(&d.year()) => d,
        _ => date,
    }
}

/// 对 YYYYMMDD 字符串形式的日期应用偏移量
///
/// 无法解析的输入原样返回，保证缺失或畸形的日期字段不会中断处理。
pub fn shift_dicom_date(value: &str, offset_days: i64) -> String {
    match parse_dicom_date(value) {
        Some(date) => format_dicom_date(shift_date(date, offset_days)),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pseudo_id_is_valid_uid() {
        let id = generate_pseudo_id();
        assert!(is_valid_dicom_uid(&id));
    }

    #[test]
    fn test_pseudo_ids_are_distinct() {
        let a = generate_pseudo_id();
        let b = generate_pseudo_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
    }

    #[test]
    fn test_shift_date_small_negative_offset() {
        // 小于一个月的偏移是纯天数移位
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let shifted = shift_date(date, -10);
        assert_eq!(format_dicom_date(shifted), "20231222");
    }

    #[test]
    fn test_shift_date_decomposes_into_months() {
        // 40天 = 1个月 + 10天
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let shifted = shift_date(date, 40);
        assert_eq!(format_dicom_date(shifted), "20240225");
    }

    #[test]
    fn test_shift_date_month_end_boundary() {
        // 1月31日加一个月按日历收敛到2月末
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let shifted = shift_date(date, 30);
        assert_eq!(format_dicom_date(shifted), "20240229");
    }

    #[test]
    fn test_shift_date_year_out_of_range_falls_back() {
        let date = NaiveDate::from_ymd_opt(2100, 12, 25).unwrap();
        let shifted = shift_date(date, 30);
        assert_eq!(shifted, date);
    }

    #[test]
    fn test_shift_dicom_date_keeps_unparsable_value() {
        assert_eq!(shift_dicom_date("not-a-date", -10), "not-a-date");
        assert_eq!(shift_dicom_date("", 5), "");
    }

    #[test]
    fn test_shift_preserves_relative_ordering() {
        let earlier = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let later = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        for offset in [-60, -31, -1, 0, 17, 59] {
            assert!(shift_date(earlier, offset) < shift_date(later, offset));
        }
    }
}
