use crate::db::{self, Database};

const SEARCH_PAGE_LIMIT_KEY: &str = "search_page_limit";
pub const MIN_SEARCH_PAGE_LIMIT: usize = 1;
pub const MAX_SEARCH_PAGE_LIMIT: usize = 50;
const DEFAULT_SEARCH_PAGE_LIMIT: usize = 5;

/// 读取统一搜索“加载更多”的分页大小；缺失时返回默认值，错误时透传。
pub fn get_search_page_limit(database: &Database) -> Result<usize, String> {
    let stored = database.with_connection(|conn| db::get_setting(conn, SEARCH_PAGE_LIMIT_KEY))?;
    match stored {
        Some(value) => parse_and_clamp(&value),
        None => Ok(DEFAULT_SEARCH_PAGE_LIMIT),
    }
}

/// 写入并校验分页大小，限定在 [MIN, MAX] 区间。
pub fn set_search_page_limit(database: &Database, value: usize) -> Result<usize, String> {
    if !(MIN_SEARCH_PAGE_LIMIT..=MAX_SEARCH_PAGE_LIMIT).contains(&value) {
        return Err(format!(
            "search page limit must be between {} and {}",
            MIN_SEARCH_PAGE_LIMIT, MAX_SEARCH_PAGE_LIMIT
        ));
    }
    let value_str = value.to_string();
    database.with_connection(|conn| db::set_setting(conn, SEARCH_PAGE_LIMIT_KEY, &value_str))?;
    Ok(value)
}

pub fn default_search_page_limit() -> usize {
    DEFAULT_SEARCH_PAGE_LIMIT
}

fn parse_and_clamp(raw: &str) -> Result<usize, String> {
    let parsed = raw
        .parse::<usize>()
        .map_err(|e| format!("invalid search page limit value: {e}"))?;
    Ok(parsed.clamp(MIN_SEARCH_PAGE_LIMIT, MAX_SEARCH_PAGE_LIMIT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_five() {
        let database = Database::open_in_memory().unwrap();
        assert_eq!(get_search_page_limit(&database).unwrap(), 5);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let database = Database::open_in_memory().unwrap();
        assert!(set_search_page_limit(&database, 0).is_err());
        assert!(set_search_page_limit(&database, 51).is_err());
        assert_eq!(set_search_page_limit(&database, 20).unwrap(), 20);
        assert_eq!(get_search_page_limit(&database).unwrap(), 20);
    }

    #[test]
    fn clamps_values_written_by_older_builds() {
        let database = Database::open_in_memory().unwrap();
        database
            .with_connection(|conn| db::set_setting(conn, SEARCH_PAGE_LIMIT_KEY, "500"))
            .unwrap();
        assert_eq!(get_search_page_limit(&database).unwrap(), MAX_SEARCH_PAGE_LIMIT);
    }
}
