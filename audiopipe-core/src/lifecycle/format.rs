use chrono::Duration;

const MAX_FILENAME_CHARS: usize = 100;

/// `3.52 MB` at or above one mebibyte, `512.00 KB` below it.
pub fn format_size(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    let mb = kb / 1024.0;
    if mb >= 1.0 {
        format!("{mb:.2} MB")
    } else {
        format!("{kb:.2} KB")
    }
}

pub fn expires_text(remaining: Duration) -> String {
    let days = remaining.num_days();
    let hours = remaining.num_hours() - days * 24;
    if days > 0 {
        let mut text = format!("File expires in {days} {}", plural(days, "day"));
        if hours > 0 {
            text.push_str(&format!(" and {hours} {}", plural(hours, "hour")));
        }
        text
    } else if hours > 0 {
        format!("File expires in {hours} {}", plural(hours, "hour"))
    } else {
        "File expires in less than an hour".to_string()
    }
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        unit.to_string()
    } else {
        format!("{unit}s")
    }
}

/// Download filename derived from the media title, safe for a
/// `Content-Disposition` header on any platform.
pub fn suggested_filename(title: Option<&str>, task_id: &str) -> String {
    let cleaned: String = title
        .unwrap_or_default()
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '?' | '*' | '"' | '<' | '>' | '|' => '_',
            ch if !ch.is_ascii() || ch.is_ascii_control() => '_',
            ch => ch,
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '_' || ch == '.') {
        return format!("audio_{task_id}.mp3");
    }
    let stem = if cleaned.len() > MAX_FILENAME_CHARS {
        format!("{}...", &cleaned[..MAX_FILENAME_CHARS - 3])
    } else {
        cleaned.to_string()
    };
    format!("{stem}.mp3")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_switch_units_at_one_megabyte() {
        assert_eq!(format_size(512 * 1024), "512.00 KB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_size(3_690_987), "3.52 MB");
        assert_eq!(format_size(0), "0.00 KB");
    }

    #[test]
    fn expiry_text_reads_naturally() {
        assert_eq!(
            expires_text(Duration::days(6) + Duration::hours(23) + Duration::minutes(5)),
            "File expires in 6 days and 23 hours"
        );
        assert_eq!(
            expires_text(Duration::days(1) + Duration::minutes(30)),
            "File expires in 1 day"
        );
        assert_eq!(expires_text(Duration::hours(1)), "File expires in 1 hour");
        assert_eq!(
            expires_text(Duration::minutes(20)),
            "File expires in less than an hour"
        );
    }

    #[test]
    fn filenames_are_sanitised() {
        assert_eq!(
            suggested_filename(Some("AC/DC: Back in Black?"), "task-1"),
            "AC_DC_ Back in Black_.mp3"
        );
        assert_eq!(suggested_filename(Some("Café"), "task-1"), "Caf_.mp3");
        assert_eq!(suggested_filename(None, "task-1"), "audio_task-1.mp3");
        assert_eq!(suggested_filename(Some("日本"), "task-1"), "audio_task-1.mp3");

        let long = "x".repeat(150);
        let name = suggested_filename(Some(&long), "task-1");
        assert_eq!(name.len(), 100 + ".mp3".len());
        assert!(name.ends_with("....mp3"));
    }
}
