use crate::db::{self, Database};

const SHOW_HIDDEN_FILES_KEY: &str = "show_hidden_files";

/// 收藏列表拉取时是否包含隐藏文件；默认不包含。
pub fn get_show_hidden_files(database: &Database) -> Result<bool, String> {
    let stored = database.with_connection(|conn| db::get_setting(conn, SHOW_HIDDEN_FILES_KEY))?;
    Ok(matches!(stored.as_deref(), Some("1") | Some("true")))
}

pub fn set_show_hidden_files(database: &Database, show: bool) -> Result<bool, String> {
    let value = if show { "1" } else { "0" };
    database.with_connection(|conn| db::set_setting(conn, SHOW_HIDDEN_FILES_KEY, value))?;
    Ok(show)
}
