//! M3U export of the served lineup (`GET /live.m3u`)

use crate::catalog::LiveChannel;

/// Render the shaped lineup as an extended M3U playlist. Stream URLs point
/// back at this instance so clients get failover and admission control.
pub fn render_live_m3u(channels: &[LiveChannel], base_url: &str) -> String {
    // ~120 bytes of attributes plus the URL per channel
    let mut out = String::with_capacity(16 + channels.len() * 200);
    out.push_str("#EXTM3U\n");

    for ch in channels {
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\" tvg-logo=\"{}\" group-title=\"{}\",{}\n",
            escape_attr(&ch.tvg_id),
            escape_attr(&ch.guide_name),
            escape_attr(&ch.tvg_logo),
            escape_attr(&ch.group_title),
            ch.guide_name
        ));
        out.push_str(base_url);
        out.push_str("/stream/");
        out.push_str(&ch.channel_id);
        out.push('\n');
    }
    out
}

/// Double quotes inside attribute values would break the EXTINF grammar.
fn escape_attr(value: &str) -> String {
    value.replace('"', "'")
}
