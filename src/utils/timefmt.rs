/// Formats seconds as `H:MM:SS`, rounding to whole seconds.
pub fn format_duration(seconds: f64) -> String {
    let negative = seconds < 0.0;
    let total = seconds.abs().round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let sign = if negative { "-" } else { "" };
    format!("{sign}{h}:{m:02}:{s:02}")
}
