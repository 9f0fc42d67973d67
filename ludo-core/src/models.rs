use serde::{Deserialize, Serialize};

const ICON_BASE_URL: &str = "https://media.steampowered.com/steamcommunity/public/images/apps";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OwnedGame {
    pub appid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub playtime_forever: i64,
    #[serde(default)]
    pub playtime_2weeks: Option<i64>,
    #[serde(default)]
    pub img_icon_url: Option<String>,
    #[serde(default)]
    pub rtime_last_played: Option<i64>,
}

impl OwnedGame {
    pub fn icon_url(&self) -> Option<String> {
        icon_url(self.appid, self.img_icon_url.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RecentGame {
    pub appid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub playtime_2weeks: i64,
    #[serde(default)]
    pub playtime_forever: i64,
    #[serde(default)]
    pub img_icon_url: Option<String>,
}

impl RecentGame {
    pub fn icon_url(&self) -> Option<String> {
        icon_url(self.appid, self.img_icon_url.as_deref())
    }
}

impl From<RecentGame> for OwnedGame {
    fn from(game: RecentGame) -> Self {
        Self {
            appid: game.appid,
            name: game.name,
            playtime_forever: game.playtime_forever,
            playtime_2weeks: Some(game.playtime_2weeks),
            img_icon_url: game.img_icon_url,
            rtime_last_played: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlayerProfile {
    pub steamid: String,
    #[serde(default)]
    pub personaname: Option<String>,
    #[serde(default)]
    pub profileurl: Option<String>,
    #[serde(default)]
    pub avatarfull: Option<String>,
    #[serde(default)]
    pub communityvisibilitystate: Option<i64>,
    #[serde(default)]
    pub lastlogoff: Option<i64>,
}

impl PlayerProfile {
    /// Only public profiles (visibility state 3) expose their library.
    pub fn is_public(&self) -> bool {
        self.communityvisibilitystate == Some(3)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GameDetails {
    pub steam_appid: u32,
    pub name: String,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub header_image: Option<String>,
    #[serde(default)]
    pub developers: Vec<String>,
    #[serde(default)]
    pub publishers: Vec<String>,
    #[serde(default)]
    pub genres: Vec<Genre>,
    #[serde(default)]
    pub release_date: Option<ReleaseDate>,
    #[serde(default)]
    pub metacritic: Option<Metacritic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Genre {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReleaseDate {
    #[serde(default)]
    pub coming_soon: bool,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Metacritic {
    pub score: i64,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReviewSummary {
    #[serde(default)]
    pub review_score: i64,
    #[serde(default)]
    pub review_score_desc: Option<String>,
    #[serde(default)]
    pub total_positive: i64,
    #[serde(default)]
    pub total_negative: i64,
    #[serde(default)]
    pub total_reviews: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub response: T,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OwnedGamesResponse {
    #[serde(default)]
    pub games: Vec<OwnedGame>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RecentGamesResponse {
    #[serde(default)]
    pub games: Vec<RecentGame>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PlayerSummariesResponse {
    #[serde(default)]
    pub players: Vec<PlayerProfile>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AppDetailsEntry {
    pub success: bool,
    #[serde(default)]
    pub data: Option<GameDetails>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewsResponse {
    pub success: i64,
    #[serde(default)]
    pub query_summary: Option<ReviewSummary>,
}

fn icon_url(appid: u32, hash: Option<&str>) -> Option<String> {
    hash.filter(|hash| !hash.is_empty())
        .map(|hash| format!("{ICON_BASE_URL}/{appid}/{hash}.jpg"))
}
