use std::time::Duration;

pub fn bytes_to_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|x| format!("{:02X}", x))
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = total % 3600 / 60;
    let seconds = total % 60;

    let mut ret = String::new();
    if hours > 0 {
        ret += &format!("{} hr, ", hours);
    }
    if minutes > 0 || !ret.is_empty() {
        ret += &format!("{} min, ", minutes);
    }
    ret + &format!("{} sec", seconds)
}

#[test]
fn format_duration_test() {
    assert_eq!(format_duration(Duration::from_secs(42)), "42 sec");
    assert_eq!(format_duration(Duration::from_secs(62)), "1 min, 2 sec");
    assert_eq!(
        format_duration(Duration::from_secs(3723)),
        "1 hr, 2 min, 3 sec"
    );
    assert_eq!(
        format_duration(Duration::from_secs(3600)),
        "1 hr, 0 min, 0 sec"
    );
}
