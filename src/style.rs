use std::fmt;
use std::str::FromStr;

use serde::{de::Error as DeError, Deserialize, Deserializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Moderator,
    Member,
    #[default]
    Normal,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Owner, Role::Moderator, Role::Member, Role::Normal];

    /// Map a YouTube badge tooltip ("Moderator", "Member (2 years)", ...) to a role.
    pub fn from_badge_tooltip(tooltip: &str) -> Self {
        let tooltip = tooltip.to_ascii_lowercase();
        if tooltip.contains("owner") {
            Role::Owner
        } else if tooltip.contains("moderator") {
            Role::Moderator
        } else if tooltip.contains("member") {
            Role::Member
        } else {
            Role::Normal
        }
    }

    pub fn priority(self) -> u8 {
        match self {
            Role::Owner => 3,
            Role::Moderator => 2,
            Role::Member => 1,
            Role::Normal => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Moderator => "moderator",
            Role::Member => "member",
            Role::Normal => "normal",
        }
    }
}

/// Straight (non-premultiplied) RGBA color, written `#rgb`, `#rrggbb` or `#rrggbbaa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const BLACK: Rgba = Rgba([0, 0, 0, 255]);
    pub const WHITE: Rgba = Rgba([255, 255, 255, 255]);
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Rgba([r, g, b, 255])
    }
}

impl FromStr for Rgba {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let hex = raw.trim().trim_start_matches('#');
        if !hex.is_ascii() {
            return Err(format!("invalid color '{raw}': not hexadecimal"));
        }
        let expanded = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect::<String>(),
            6 | 8 => hex.to_owned(),
            _ => return Err(format!("invalid color '{raw}': expected #rgb, #rrggbb or #rrggbbaa")),
        };
        let channel = |idx: usize| {
            u8::from_str_radix(&expanded[idx * 2..idx * 2 + 2], 16)
                .map_err(|_| format!("invalid color '{raw}': not hexadecimal"))
        };
        let alpha = if expanded.len() == 8 { channel(3)? } else { 255 };
        Ok(Rgba([channel(0)?, channel(1)?, channel(2)?, alpha]))
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        if a == 255 {
            write!(f, "#{r:02x}{g:02x}{b:02x}")
        } else {
            write!(f, "#{r:02x}{g:02x}{b:02x}{a:02x}")
        }
    }
}

impl<'de> Deserialize<'de> for Rgba {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Fully resolved (scaled, defaulted) styling for one role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleStyle {
    pub author_color: Rgba,
    pub message_color: Rgba,
    pub author_font_size: u32,
    pub message_font_size: u32,
    pub line_height: u32,
    pub avatar_size: u32,
    pub emoji_size: u32,
    pub padding: u32,
}

/// Explicit role-to-style mapping; every role always has an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleTable {
    pub owner: RoleStyle,
    pub moderator: RoleStyle,
    pub member: RoleStyle,
    pub normal: RoleStyle,
}

impl StyleTable {
    pub fn get(&self, role: Role) -> &RoleStyle {
        match role {
            Role::Owner => &self.owner,
            Role::Moderator => &self.moderator,
            Role::Member => &self.member,
            Role::Normal => &self.normal,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &RoleStyle)> {
        Role::ALL.into_iter().map(move |role| (role, self.get(role)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_long_and_alpha_hex() {
        assert_eq!("#fff".parse::<Rgba>().unwrap(), Rgba::WHITE);
        assert_eq!("#ffd600".parse::<Rgba>().unwrap(), Rgba::rgb(0xff, 0xd6, 0x00));
        assert_eq!("00000080".parse::<Rgba>().unwrap(), Rgba([0, 0, 0, 0x80]));
        assert!("#12".parse::<Rgba>().is_err());
        assert!("#gggggg".parse::<Rgba>().is_err());
        assert_eq!(Rgba::rgb(15, 15, 15).to_string(), "#0f0f0f");
    }

    #[test]
    fn badge_tooltips_map_to_roles() {
        assert_eq!(Role::from_badge_tooltip("Owner"), Role::Owner);
        assert_eq!(Role::from_badge_tooltip("Member (1 year)"), Role::Member);
        assert_eq!(Role::from_badge_tooltip("Verified"), Role::Normal);
    }
}
