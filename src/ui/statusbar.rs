//! Status bar text: session name and window list on the left, clock on the right

use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use tracing::warn;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::config::{StatusBarConfig, DEFAULT_TIME_FORMAT};

/// One entry of the window list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLabel {
    pub index: usize,
    pub name: String,
    pub active: bool,
}

/// Builds the bottom row shown by every renderer
#[derive(Debug, Clone)]
pub struct StatusBar {
    config: StatusBarConfig,
}

impl StatusBar {
    /// An invalid clock format is replaced by the default one.
    pub fn new(mut config: StatusBarConfig) -> Self {
        if !is_valid_time_format(&config.time_format) {
            warn!(
                "Invalid status bar time_format {:?}, using {:?}",
                config.time_format, DEFAULT_TIME_FORMAT
            );
            config.time_format = DEFAULT_TIME_FORMAT.to_string();
        }
        Self { config }
    }

    /// `tilemux  1:sh* 2:vim`
    pub fn left_text(&self, windows: &[WindowLabel]) -> String {
        let mut text = String::from("tilemux ");
        for label in windows {
            text.push(' ');
            text.push_str(&format!("{}:{}", label.index, label.name));
            if label.active {
                text.push('*');
            }
        }
        text
    }

    pub fn right_text(&self) -> String {
        if !self.config.show_time {
            return String::new();
        }
        let mut text = String::new();
        if write!(text, "{}", chrono::Local::now().format(&self.config.time_format)).is_err() {
            return String::new();
        }
        text
    }
}

/// Whether chrono understands every specifier in `format`
pub fn is_valid_time_format(format: &str) -> bool {
    StrftimeItems::new(format).all(|item| !matches!(item, Item::Error))
}

/// Pad between `left` and `right` or truncate so the result spans `width` columns.
///
/// `right` is dropped first when both do not fit.
pub fn fit_line(left: &str, right: &str, width: usize) -> String {
    let left_width = left.width();
    let right_width = right.width();

    if left_width + right_width + 1 <= width {
        let padding = width - left_width - right_width;
        return format!("{}{}{}", left, " ".repeat(padding), right);
    }

    let mut out = String::new();
    let mut used = 0;
    for ch in left.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push_str(&" ".repeat(width - used));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<WindowLabel> {
        vec![
            WindowLabel { index: 1, name: "sh".into(), active: true },
            WindowLabel { index: 2, name: "vim".into(), active: false },
        ]
    }

    #[test]
    fn test_left_text_lists_windows() {
        let bar = StatusBar::new(StatusBarConfig::default());
        assert_eq!(bar.left_text(&labels()), "tilemux  1:sh* 2:vim");
    }

    #[test]
    fn test_fit_line_pads() {
        let line = fit_line("left", "right", 20);
        assert_eq!(line, "left           right");
        assert_eq!(line.width(), 20);
    }

    #[test]
    fn test_fit_line_truncates() {
        assert_eq!(fit_line("abcdefghij", "12:00", 8), "abcdefgh");
        assert_eq!(fit_line("ab", "", 0), "");
    }

    #[test]
    fn test_fit_line_wide_chars() {
        // A wide char that would straddle the edge is replaced by padding.
        let line = fit_line("ab漢字", "", 5);
        assert_eq!(line, "ab漢 ");
        assert_eq!(line.width(), 5);
    }

    #[test]
    fn test_clock_disabled() {
        let config = StatusBarConfig {
            show_time: false,
            ..StatusBarConfig::default()
        };
        assert_eq!(StatusBar::new(config).right_text(), "");
    }

    #[test]
    fn test_invalid_time_format_falls_back() {
        assert!(is_valid_time_format("%H:%M"));
        assert!(!is_valid_time_format("%Q"));

        let config = StatusBarConfig {
            show_time: true,
            time_format: "%Q".into(),
        };
        let bar = StatusBar::new(config);
        assert_eq!(bar.config.time_format, DEFAULT_TIME_FORMAT);
        // Renders instead of panicking: "2026-10-19 12:00:00".
        assert_eq!(bar.right_text().len(), 19);
    }
}
