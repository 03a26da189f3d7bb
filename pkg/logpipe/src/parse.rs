//! Log line and chat command parsing.
//!
//! Every incoming line is `<secret><rest-of-line>` where the secret is a
//! 32-hex-digit per-reservation token. Chat lines inside the stream look
//! like
//!
//! `L 08/28/2026 - 20:15:01: "Alice<3><[U:1:111]><Red>" say "!extend"`
//!
//! and only the small fixed command grammar below is interpreted.

/// A fixed chat command addressed at the reservation system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    End,
    Extend,
    /// Remainder of the line, forwarded verbatim over RCON.
    Rcon(String),
}

/// An in-game chat message extracted from a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub name: String,
    pub steam_id: String,
    pub message: String,
}

/// Split a raw line into its secret prefix and payload. Lines without a
/// full 32-hex-digit prefix are unattributable and dropped upstream.
pub fn split_secret(line: &str) -> Option<(&str, &str)> {
    if line.len() < 33 || !line.is_char_boundary(32) {
        return None;
    }
    let (secret, rest) = line.split_at(32);
    if !secret.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((secret, rest))
}

/// Extract a chat message from a log line payload, `None` for anything
/// that is not a `say`/`say_team`.
pub fn parse_chat_line(rest: &str) -> Option<ChatLine> {
    let (head, tail) = match rest.find("\" say \"") {
        Some(idx) => (&rest[..idx], &rest[idx + "\" say \"".len()..]),
        None => {
            let idx = rest.find("\" say_team \"")?;
            (&rest[..idx], &rest[idx + "\" say_team \"".len()..])
        }
    };
    let message = tail.trim_end().strip_suffix('"')?;
    let player_start = head.rfind(": \"")? + 3;
    let (name, steam_id) = parse_player(&head[player_start..])?;
    Some(ChatLine {
        name: name.to_string(),
        steam_id: steam_id.to_string(),
        message: message.to_string(),
    })
}

/// `Alice<3><[U:1:111]><Red>` -> ("Alice", "[U:1:111]").
/// Parsed right-to-left: player names may contain `<`.
fn parse_player(block: &str) -> Option<(&str, &str)> {
    let block = block.strip_suffix('>')?;
    let (rest, _team) = block.rsplit_once('<')?;
    let rest = rest.strip_suffix('>')?;
    let (rest, steam_id) = rest.rsplit_once('<')?;
    let rest = rest.strip_suffix('>')?;
    let (name, _user_id) = rest.rsplit_once('<')?;
    Some((name, steam_id))
}

/// Match a chat message against the command grammar.
pub fn parse_command(message: &str) -> Option<ChatCommand> {
    let message = message.trim();
    if message.starts_with("!extend") {
        return Some(ChatCommand::Extend);
    }
    if message.starts_with("!end") {
        return Some(ChatCommand::End);
    }
    if let Some(rest) = message.strip_prefix("!rcon ") {
        let rest = rest.trim();
        if !rest.is_empty() {
            return Some(ChatCommand::Rcon(rest.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn secret_prefix_split() {
        let line = format!("{}L 08/28/2026 - 20:15:01: payload", SECRET);
        let (secret, rest) = split_secret(&line).unwrap();
        assert_eq!(secret, SECRET);
        assert!(rest.starts_with("L 08/28"));

        assert!(split_secret("too-short").is_none());
        // right length, wrong alphabet
        let bad = format!("{}Z{}", &SECRET[..31], "L rest of line here");
        assert!(split_secret(&bad).is_none());
        // bare secret with no payload
        assert!(split_secret(SECRET).is_none());
    }

    #[test]
    fn chat_line_extraction() {
        let rest = r#"L 08/28/2026 - 20:15:01: "Alice<3><[U:1:111]><Red>" say "!extend""#;
        let chat = parse_chat_line(rest).unwrap();
        assert_eq!(chat.name, "Alice");
        assert_eq!(chat.steam_id, "[U:1:111]");
        assert_eq!(chat.message, "!extend");
    }

    #[test]
    fn say_team_also_counts() {
        let rest = r#"L 08/28/2026 - 20:15:01: "Bob<7><[U:1:222]><Blue>" say_team "!end please""#;
        let chat = parse_chat_line(rest).unwrap();
        assert_eq!(chat.steam_id, "[U:1:222]");
        assert_eq!(chat.message, "!end please");
    }

    #[test]
    fn angle_brackets_in_names_survive() {
        let rest = r#"L 08/28/2026 - 20:15:01: "<eVa> Carol<9><[U:1:333]><Red>" say "hi""#;
        let chat = parse_chat_line(rest).unwrap();
        assert_eq!(chat.name, "<eVa> Carol");
        assert_eq!(chat.steam_id, "[U:1:333]");
    }

    #[test]
    fn non_chat_lines_are_ignored() {
        assert!(parse_chat_line(r#"L 08/28/2026 - 20:15:01: World triggered "Round_Start""#).is_none());
        assert!(parse_chat_line("").is_none());
    }

    #[test]
    fn command_grammar() {
        assert_eq!(parse_command("!end"), Some(ChatCommand::End));
        assert_eq!(parse_command("!end it now"), Some(ChatCommand::End));
        assert_eq!(parse_command("!extend"), Some(ChatCommand::Extend));
        assert_eq!(
            parse_command("!rcon changelevel cp_badlands"),
            Some(ChatCommand::Rcon("changelevel cp_badlands".into()))
        );
        assert_eq!(parse_command("!rcon "), None);
        assert_eq!(parse_command("gg wp"), None);
        assert_eq!(parse_command("end"), None);
    }
}
