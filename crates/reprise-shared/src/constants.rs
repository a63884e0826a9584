/// Application name
pub const APP_NAME: &str = "Reprise";

/// Version string written into the store document
pub const STORE_FORMAT_VERSION: &str = "2.0";

/// Keyword length bounds, counted in characters
pub const KEYWORD_MIN_LEN: usize = 2;
pub const KEYWORD_MAX_LEN: usize = 50;

/// Maximum downloadable media size in bytes (20 MiB)
pub const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Per-attempt HTTP timeout for media downloads in seconds
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Download attempts before giving up
pub const DOWNLOAD_MAX_ATTEMPTS: u32 = 3;

/// Retry backoff: base delay doubles per attempt, capped
pub const DOWNLOAD_BACKOFF_BASE_MS: u64 = 1_000;
pub const DOWNLOAD_BACKOFF_CAP_MS: u64 = 10_000;

/// Default per-principal request ceiling per window
pub const RATE_LIMIT_CEILING: u32 = 30;

/// Default rate window length in seconds
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Advisory warning fires when the count reaches `ceiling - RATE_WARNING_MARGIN`
pub const RATE_WARNING_MARGIN: u32 = 5;

/// Interval of the expired-window sweep in seconds
pub const RATE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Delete-confirmation prompts auto-expire after this many seconds
pub const CONFIRM_TIMEOUT_SECS: u64 = 30;

/// Backup file naming: `<prefix>-<timestamp>-<tag>.<ext>`
pub const BACKUP_PREFIX: &str = "database-backup";
pub const BACKUP_EXTENSION: &str = "json";

/// Default number of retained backups
pub const MAX_BACKUP_FILES: usize = 10;

/// Platform limit on inline-button callback data, in bytes
pub const CALLBACK_DATA_MAX: usize = 64;

/// Filters shown per page in a listing
pub const FILTERS_PER_PAGE: usize = 20;

/// Default allowed media extensions (lowercase, with leading dot)
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".mp4", ".avi", ".mkv", ".mov", ".webm",
    ".mp3", ".ogg", ".oga", ".wav", ".m4a", ".pdf", ".doc", ".docx", ".txt", ".zip", ".rar",
];

/// Fallback extension lookup when the remote path has none
pub const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("image/png", ".png"),
    ("image/gif", ".gif"),
    ("image/webp", ".webp"),
    ("video/mp4", ".mp4"),
    ("video/webm", ".webm"),
    ("audio/mpeg", ".mp3"),
    ("audio/ogg", ".ogg"),
    ("application/pdf", ".pdf"),
    ("text/plain", ".txt"),
];

/// Map a `Content-Type` value (parameters ignored) to a file extension.
pub fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    MIME_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == essence)
        .map(|(_, ext)| *ext)
}
