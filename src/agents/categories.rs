//! 新闻分类

/// 四个主分类（顺序即摘要分节顺序）
pub const CATEGORIES: [&str; 4] = [
    "законодательные инициативы",
    "новая судебная практика",
    "новые законы",
    "поправки к законам",
];

/// 兜底分类
pub const OTHER: &str = "другое";

/// 「другое」分节标题
pub const OTHER_HEADING: &str = "ДРУГИЕ НОВОСТИ";

/// 全部分类（含兜底，兜底在最后）
pub fn all() -> impl Iterator<Item = &'static str> {
    CATEGORIES.iter().copied().chain(std::iter::once(OTHER))
}

/// 是否为合法分类名
pub fn is_known(name: &str) -> bool {
    all().any(|c| c == name)
}

/// 规范化：大小写无关地取回静态分类名
pub fn normalize(name: &str) -> Option<&'static str> {
    let lower = name.trim().to_lowercase();
    all().find(|c| *c == lower)
}

/// 在任意文本中查找第一个出现的分类名（子串匹配，大小写无关）
pub fn match_category(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    all().find(|c| lower.contains(c))
}

/// 按钮上的短名：超过 15 个字符时截断
pub fn short_name(name: &str) -> String {
    if name.chars().count() > 15 {
        format!("{}...", name.chars().take(15).collect::<String>())
    } else {
        name.to_string()
    }
}

/// 摘要中的分节标题
pub fn heading(name: &str) -> String {
    if name == OTHER {
        OTHER_HEADING.to_string()
    } else {
        name.to_uppercase()
    }
}

/// 分类在摘要中的排序位置（未知分类排在最后）
pub fn order_of(name: &str) -> usize {
    all().position(|c| c == name).unwrap_or(CATEGORIES.len() + 1)
}

/// 提示词里的分类说明
pub const CATEGORY_GUIDE: &str = "\
1. Законодательные инициативы - предложения о создании новых законов или нормативных актов, находящиеся на стадии обсуждения, внесения или рассмотрения в Госдуме. Признаки: \"законопроект\", \"проект закона\", \"внесен на рассмотрение\", \"планируется принять\".
2. Новая судебная практика - решения, определения, постановления судов, создающие прецеденты или разъясняющие применение норм права. Признаки: упоминание судов (ВС, Верховный Суд, КС, арбитражный суд), номеров дел, слов \"решение\", \"определение\", \"постановление\", \"практика\".
3. Новые законы - недавно принятые и вступившие или вступающие в силу законодательные акты. Признаки: \"закон принят\", \"закон подписан\", \"вступает в силу\", номер федерального закона.
4. Поправки к законам - изменения в существующих законах. Признаки: \"внесены изменения\", \"поправки\", \"новая редакция\", \"дополнен статьей\".
5. Другое - всё, что не относится к перечисленным категориям.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_category() {
        assert_eq!(match_category("Категория: Новые законы"), Some("новые законы"));
        assert_eq!(match_category("это скорее ДРУГОЕ"), Some(OTHER));
        assert_eq!(match_category("не знаю"), None);
    }

    #[test]
    fn test_order_and_heading() {
        assert_eq!(order_of("законодательные инициативы"), 0);
        assert_eq!(order_of(OTHER), 4);
        assert!(order_of("что-то") > order_of(OTHER));
        assert_eq!(heading(OTHER), "ДРУГИЕ НОВОСТИ");
        assert_eq!(heading("новые законы"), "НОВЫЕ ЗАКОНЫ");
    }

    #[test]
    fn test_short_name_and_normalize() {
        assert_eq!(short_name("новые законы"), "новые законы");
        assert_eq!(short_name("законодательные инициативы"), "законодательные...");
        assert_eq!(normalize(" Новые Законы "), Some("новые законы"));
        assert!(is_known(OTHER));
        assert!(!is_known("спорт"));
    }
}
