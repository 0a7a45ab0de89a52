//! 日期工具：本地日界、/period 参数解析

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};

use crate::storage::DigestSelection;

/// 闭区间日期段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// 以 end 为最后一天、向前共 days 天
    pub fn last_days(end: NaiveDate, days: u32) -> Self {
        let days = i64::from(days.max(1));
        Self {
            start: end - Duration::days(days - 1),
            end,
        }
    }

    /// 两端各扩展 days 天
    pub fn widen(&self, days: i64) -> Self {
        Self {
            start: self.start - Duration::days(days),
            end: self.end + Duration::days(days),
        }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// 转为 UTC 时间闭区间
    pub fn bounds(&self, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
        (start_of_day(self.start, offset), end_of_day(self.end, offset))
    }

    pub fn describe(&self) -> String {
        if self.start == self.end {
            format_ru_date(self.start)
        } else {
            format!("{} - {}", format_ru_date(self.start), format_ru_date(self.end))
        }
    }
}

/// /period 请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodRequest {
    pub period: Period,
    pub selection: DigestSelection,
}

/// 小时偏移 -> FixedOffset（非法值回退 UTC）
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn local_today(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}

pub fn start_of_day(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    offset
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

/// 当天最后一毫秒
pub fn end_of_day(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    start_of_day(date + Duration::days(1), offset) - Duration::milliseconds(1)
}

pub fn format_ru_date(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}

fn parse_day(token: &str, today: NaiveDate) -> Option<NaiveDate> {
    match token.to_lowercase().as_str() {
        "today" | "сегодня" => Some(today),
        "yesterday" | "вчера" => Some(today - Duration::days(1)),
        other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(other, "%d.%m.%Y"))
            .ok(),
    }
}

/// 解析 `/period` 参数：`today` / `yesterday` / `YYYY-MM-DD` / `YYYY-MM-DD YYYY-MM-DD`，可附加 `brief|detailed|both`
pub fn parse_period(input: &str, today: NaiveDate) -> Result<PeriodRequest, String> {
    let mut tokens: Vec<&str> = input.split_whitespace().filter(|t| *t != "-" && *t != "—").collect();
    if tokens.is_empty() {
        return Err("Укажите период: today, yesterday, YYYY-MM-DD или YYYY-MM-DD YYYY-MM-DD".to_string());
    }

    let mut selection = DigestSelection::Brief;
    if let Some(last) = tokens.last() {
        if let Some(sel) = DigestSelection::parse(last) {
            selection = sel;
            tokens.pop();
        }
    }

    let days: Vec<NaiveDate> = tokens
        .iter()
        .map(|t| parse_day(t, today).ok_or_else(|| format!("Не удалось распознать дату: {t}")))
        .collect::<Result<_, _>>()?;

    let period = match days.as_slice() {
        [day] => Period::single(*day),
        [a, b] if a <= b => Period { start: *a, end: *b },
        [a, b] => Period { start: *b, end: *a },
        [] => return Err("Укажите дату".to_string()),
        _ => return Err("Слишком много дат: укажите одну дату или диапазон из двух".to_string()),
    };

    if period.end > today {
        return Err("Нельзя запросить дайджест за будущие даты".to_string());
    }

    Ok(PeriodRequest { period, selection })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_period_keywords() {
        let today = d(2025, 3, 14);
        let req = parse_period("today", today).unwrap();
        assert_eq!(req.period, Period::single(today));
        assert_eq!(req.selection, DigestSelection::Brief);

        let req = parse_period("вчера detailed", today).unwrap();
        assert_eq!(req.period, Period::single(d(2025, 3, 13)));
        assert_eq!(req.selection, DigestSelection::Detailed);
    }

    #[test]
    fn test_parse_period_range_is_ordered() {
        let today = d(2025, 3, 14);
        let req = parse_period("2025-03-10 2025-03-01 both", today).unwrap();
        assert_eq!(req.period, Period { start: d(2025, 3, 1), end: d(2025, 3, 10) });
        assert_eq!(req.period.days(), 10);
        assert_eq!(req.selection, DigestSelection::Both);
    }

    #[test]
    fn test_parse_period_errors() {
        let today = d(2025, 3, 14);
        assert!(parse_period("", today).is_err());
        assert!(parse_period("завтра", today).is_err());
        assert!(parse_period("2025-03-20", today).is_err());
        assert!(parse_period("2025-03-01 2025-03-02 2025-03-03", today).is_err());
    }

    #[test]
    fn test_day_bounds_with_offset() {
        let msk = offset_from_hours(3);
        let day = d(2025, 3, 14);
        let (start, end) = Period::single(day).bounds(msk);
        assert_eq!(start.to_rfc3339(), "2025-03-13T21:00:00+00:00");
        assert_eq!((end - start).num_milliseconds(), 24 * 3600 * 1000 - 1);
    }

    #[test]
    fn test_widen_and_last_days() {
        let p = Period::single(d(2025, 3, 14)).widen(1);
        assert_eq!(p.start, d(2025, 3, 13));
        assert_eq!(p.end, d(2025, 3, 15));
        let last = Period::last_days(d(2025, 3, 14), 7);
        assert_eq!(last.start, d(2025, 3, 8));
        assert_eq!(last.days(), 7);
        assert_eq!(Period::single(d(2025, 1, 2)).describe(), "02.01.2025");
    }
}
