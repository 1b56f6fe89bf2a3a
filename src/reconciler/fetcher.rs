use crate::metadata::RemoteFileEntry;

/// 目录列表请求的附加选项。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListingOptions {
    pub show_hidden_files: bool,
}

/// 拉取某个目录下的远端列表。错误以字符串返回，由调用方统一包装成 `FetchFailed`，
/// 这样替换传输实现时错误分类保持不变。
pub trait RemoteListingFetcher: Send + Sync {
    fn fetch(
        &self,
        server_url: &str,
        account: &str,
        options: &ListingOptions,
    ) -> Result<Vec<RemoteFileEntry>, String>;
}

/// 拉取账号下全部收藏条目。
pub trait FavoritesFetcher: Send + Sync {
    fn fetch_favorites(
        &self,
        account: &str,
        show_hidden_files: bool,
    ) -> Result<Vec<RemoteFileEntry>, String>;
}
