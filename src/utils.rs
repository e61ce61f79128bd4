use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use std::time::Duration;

/// Format duration for display in HH:MM:SS format.
///
/// Hours are the largest unit and may exceed 24.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use slotrun::utils::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(45)), "00:00:45");
/// assert_eq!(format_duration(Duration::from_secs(9045)), "02:30:45");
/// assert_eq!(format_duration(Duration::from_secs(90000)), "25:00:00");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Render a port block compactly: `5005`, `5005-5007`, or `-` when empty.
pub fn format_ports(ports: &[u16]) -> String {
    match ports {
        [] => "-".to_string(),
        [single] => single.to_string(),
        [first, .., last] => format!("{first}-{last}"),
    }
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());
