//! Message text for a group: caption, forum thread title and overflow
//! player messages, all within the endpoint's character limits.


use crate::commands::{PlayerInfo, WorldInfo};

use super::image_groups::ImageGroup;

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_THREAD_TITLE_CHARS: usize = 100;

const PHOTO_PREFIX: &str = "📸 Photos";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Caption {
    pub content: String,
    pub thread_name: Option<String>,
    /// Player names that did not fit, as separate follow-up messages
    pub overflow_messages: Vec<String>,
}

impl Caption {
    pub fn for_group(group: &ImageGroup, include_player_names: bool, is_forum: bool) -> Self {
        let players: &[PlayerInfo] = if include_player_names {
            &group.all_players
        } else {
            &[]
        };
        build_caption(&group.all_worlds, players, group.timestamp, is_forum)
    }
}

pub fn build_caption(
    worlds: &[WorldInfo],
    players: &[PlayerInfo],
    timestamp: Option<i64>,
    is_forum: bool,
) -> Caption {
    let mut content = world_header(worlds, timestamp);
    if char_len(&content) > MAX_MESSAGE_CHARS {
        log::info!(
            "Caption for {} worlds too long, using compact form",
            worlds.len()
        );
        content = compact_world_header(worlds, timestamp);
    }

    let mut remaining: &[PlayerInfo] = players;
    let mut had_players_in_main = false;

    for (i, player) in players.iter().enumerate() {
        let name = bold(&player.display_name);
        let addition = if i == 0 {
            format!(" with {}", name)
        } else {
            format!(", {}", name)
        };

        // leave room for the trailing continuation comma
        let reserve = usize::from(i + 1 < players.len());
        if char_len(&content) + char_len(&addition) + reserve > MAX_MESSAGE_CHARS {
            break;
        }
        content.push_str(&addition);
        had_players_in_main = true;
        remaining = &players[i + 1..];
    }

    if had_players_in_main && !remaining.is_empty() {
        content.push(',');
    }

    let overflow_messages = if remaining.is_empty() {
        Vec::new()
    } else {
        log::info!(
            "{} player name(s) overflow the caption into follow-up messages",
            remaining.len()
        );
        overflow_player_messages(remaining, had_players_in_main)
    };

    Caption {
        content,
        thread_name: is_forum.then(|| thread_title(worlds, timestamp)),
        overflow_messages,
    }
}

fn world_header(worlds: &[WorldInfo], timestamp: Option<i64>) -> String {
    let mut content = String::from(PHOTO_PREFIX);

    if worlds.is_empty() {
        if let Some(ts) = timestamp {
            content.push_str(&format!(" taken at <t:{}:f>", ts));
        }
        return content;
    }

    let world_parts: Vec<String> = worlds
        .iter()
        .map(|world| {
            format!(
                "{} ([VRChat](<https://vrchat.com/home/launch?worldId={}>), [VRCX](<https://vrcx.azurewebsites.net/world/{}>))",
                bold(&world.name),
                world.id,
                world.id
            )
        })
        .collect();

    content.push_str(" taken at ");
    content.push_str(&world_parts.join(", "));
    if let Some(ts) = timestamp {
        content.push_str(&format!(" at <t:{}:f>", ts));
    }
    content
}

/// World names only, dropping whole names from the end when needed
fn compact_world_header(worlds: &[WorldInfo], timestamp: Option<i64>) -> String {
    let suffix = timestamp
        .map(|ts| format!(" at <t:{}:f>", ts))
        .unwrap_or_default();
    let mut content = format!("{} from {} worlds: ", PHOTO_PREFIX, worlds.len());
    let mut listed = 0;

    for world in worlds {
        let separator = if listed == 0 { "" } else { ", " };
        let entry = format!("{}{}", separator, bold(&world.name));
        let more = format!(", and {} more", worlds.len() - listed - 1);
        let budget = MAX_MESSAGE_CHARS.saturating_sub(char_len(&suffix) + char_len(&more));
        if char_len(&content) + char_len(&entry) > budget {
            break;
        }
        content.push_str(&entry);
        listed += 1;
    }

    if listed < worlds.len() {
        content.push_str(&format!(", and {} more", worlds.len() - listed));
    }
    content.push_str(&suffix);
    content
}

fn overflow_player_messages(players: &[PlayerInfo], had_players_in_main: bool) -> Vec<String> {
    let mut messages = Vec::new();
    let mut current = if had_players_in_main {
        String::new()
    } else {
        String::from("with ")
    };
    let prefix_len = char_len(&current);
    let mut has_names = false;

    for (i, player) in players.iter().enumerate() {
        let name = bold(&player.display_name);
        if char_len(&name) + prefix_len > MAX_MESSAGE_CHARS {
            log::warn!("Skipping player name longer than a whole message");
            continue;
        }

        let addition = if has_names {
            format!(", {}", name)
        } else {
            name.clone()
        };
        let reserve = usize::from(i + 1 < players.len());

        if has_names && char_len(&current) + char_len(&addition) + reserve > MAX_MESSAGE_CHARS {
            current.push(',');
            messages.push(std::mem::take(&mut current));
            current.push_str(&name);
        } else {
            current.push_str(&addition);
        }
        has_names = true;
    }

    if has_names {
        messages.push(current);
    }
    messages
}

/// Forum thread title: world names, else the capture date
pub fn thread_title(worlds: &[WorldInfo], timestamp: Option<i64>) -> String {
    let title = if !worlds.is_empty() {
        let names: Vec<&str> = worlds.iter().map(|w| w.name.as_str()).collect();
        format!("{} from {}", PHOTO_PREFIX, names.join(", "))
    } else if let Some(date) = timestamp.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)) {
        let local = date.with_timezone(&chrono::Local);
        format!("{} from {}", PHOTO_PREFIX, local.format("%Y-%m-%d"))
    } else {
        PHOTO_PREFIX.to_string()
    };

    truncate_chars(&title, MAX_THREAD_TITLE_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if char_len(text) <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn bold(text: &str) -> String {
    format!("**{}**", text)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(name: &str, id: &str) -> WorldInfo {
        WorldInfo {
            name: name.to_string(),
            id: id.to_string(),
            instance_id: String::new(),
        }
    }

    fn players(count: usize, name_len: usize) -> Vec<PlayerInfo> {
        (0..count)
            .map(|i| PlayerInfo {
                display_name: format!("{:0width$}", i, width = name_len),
                id: format!("usr_{}", i),
            })
            .collect()
    }

    fn names_in(text: &str) -> Vec<String> {
        text.split("**")
            .enumerate()
            .filter(|(i, _)| i % 2 == 1)
            .map(|(_, s)| s.to_string())
            .collect()
    }

    #[test]
    fn test_simple_caption() {
        let caption = build_caption(
            &[world("The Plaza", "wrld_1")],
            &players(2, 3),
            Some(1_700_000_000),
            false,
        );
        assert_eq!(
            caption.content,
            "📸 Photos taken at **The Plaza** ([VRChat](<https://vrchat.com/home/launch?worldId=wrld_1>), [VRCX](<https://vrcx.azurewebsites.net/world/wrld_1>)) at <t:1700000000:f> with **000**, **001**"
        );
        assert!(caption.thread_name.is_none());
        assert!(caption.overflow_messages.is_empty());
    }

    #[test]
    fn test_caption_without_world() {
        let caption = build_caption(&[], &[], Some(42), true);
        assert_eq!(caption.content, "📸 Photos taken at <t:42:f>");
        assert!(caption.thread_name.unwrap().starts_with("📸 Photos from "));
    }

    #[test]
    fn test_player_overflow_never_splits_names() {
        let all = players(400, 12);
        let caption = build_caption(&[], &all, Some(1), false);

        assert!(char_len(&caption.content) <= MAX_MESSAGE_CHARS);
        assert!(!caption.overflow_messages.is_empty());
        for message in &caption.overflow_messages {
            assert!(char_len(message) <= MAX_MESSAGE_CHARS);
        }

        let mut seen = names_in(&caption.content);
        for message in &caption.overflow_messages {
            seen.extend(names_in(message));
        }
        let expected: Vec<String> = all.iter().map(|p| p.display_name.clone()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_overflow_separates_short_names_after_split() {
        let all: Vec<PlayerInfo> = (0..572)
            .map(|i| PlayerInfo {
                display_name: "a".to_string(),
                id: format!("usr_{}", i),
            })
            .collect();
        let messages = overflow_player_messages(&all, false);

        assert_eq!(messages.len(), 3);
        assert!(messages[0].starts_with("with **a**, **a**"));
        assert!(messages[1].starts_with("**a**, **a**"));
        assert_eq!(messages[2], "**a**, **a**");
        for message in &messages {
            assert!(char_len(message) <= MAX_MESSAGE_CHARS);
            assert!(!message.contains("****"));
        }
        let total: usize = messages.iter().map(|m| m.matches("**a**").count()).sum();
        assert_eq!(total, all.len());
    }

    #[test]
    fn test_many_worlds_use_compact_header() {
        let worlds: Vec<WorldInfo> = (0..60)
            .map(|i| world(&format!("World number {}", i), &format!("wrld_{:036}", i)))
            .collect();
        let caption = build_caption(&worlds, &players(3, 5), None, false);
        assert!(char_len(&caption.content) <= MAX_MESSAGE_CHARS);
        assert!(caption.content.contains("from 60 worlds"));
    }

    #[test]
    fn test_compact_header_drops_whole_names() {
        let worlds: Vec<WorldInfo> = (0..200)
            .map(|i| world(&format!("A rather long world name {}", i), "wrld_x"))
            .collect();
        let header = compact_world_header(&worlds, Some(5));
        assert!(char_len(&header) <= MAX_MESSAGE_CHARS);
        assert!(header.contains("more"));
        assert!(header.ends_with(" at <t:5:f>"));
        assert!(names_in(&header)
            .iter()
            .all(|n| n.starts_with("A rather long world name ")));
    }

    #[test]
    fn test_thread_title_is_bounded() {
        let worlds: Vec<WorldInfo> = (0..20).map(|i| world(&format!("Wörld {}", i), "x")).collect();
        let title = thread_title(&worlds, None);
        assert_eq!(char_len(&title), MAX_THREAD_TITLE_CHARS);
        assert!(title.ends_with("..."));
        assert_eq!(thread_title(&[], None), "📸 Photos");
    }
}
