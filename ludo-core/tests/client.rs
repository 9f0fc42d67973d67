use std::time::Duration;

use ludo_core::{ApiErrorClass, CatalogClient, CatalogError, ClientConfig};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_client(server: &MockServer) -> CatalogClient {
    CatalogClient::with_config(
        "test-key",
        ClientConfig {
            api_base_url: server.uri(),
            store_base_url: server.uri(),
            requests_per_second: 1000.0,
            burst: 50,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            ..ClientConfig::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn get_owned_games_sends_key_and_owner() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/IPlayerService/GetOwnedGames/v1/"))
        .and(query_param("key", "test-key"))
        .and(query_param("steamid", "76561197960287930"))
        .and(query_param("include_appinfo", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "game_count": 2,
                "games": [
                    {
                        "appid": 10,
                        "name": "Counter-Strike",
                        "playtime_forever": 320,
                        "img_icon_url": "6b0312cda02f5f777efa2f3318c307ff9acafbb5",
                        "rtime_last_played": 1_700_000_000
                    },
                    {
                        "appid": 70,
                        "name": "Half-Life",
                        "playtime_forever": 0,
                        "playtime_2weeks": 5
                    }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let games = client.get_owned_games("76561197960287930").await.unwrap();

    assert_eq!(games.len(), 2);
    assert_eq!(games[0].appid, 10);
    assert_eq!(games[0].playtime_forever, 320);
    assert_eq!(
        games[0].icon_url().as_deref(),
        Some(
            "https://media.steampowered.com/steamcommunity/public/images/apps/10/6b0312cda02f5f777efa2f3318c307ff9acafbb5.jpg"
        )
    );
    assert_eq!(games[1].playtime_2weeks, Some(5));
    assert_eq!(games[1].icon_url(), None);
}

#[tokio::test]
async fn private_library_yields_empty_list() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/IPlayerService/GetOwnedGames/v1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": {} })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    assert!(client.get_owned_games("1").await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_calls_are_served_from_cache() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/IPlayerService/GetRecentlyPlayedGames/v1/"))
        .and(query_param("steamid", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "total_count": 1,
                "games": [
                    { "appid": 570, "name": "Dota 2", "playtime_2weeks": 60, "playtime_forever": 9000 }
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let first = client.get_recently_played("42").await.unwrap();
    let second = client.clone().get_recently_played("42").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first[0].playtime_2weeks, 60);
    assert_eq!(client.cached_responses(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ISteamUser/GetPlayerSummaries/v2/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ISteamUser/GetPlayerSummaries/v2/"))
        .and(query_param("steamids", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "players": [
                    {
                        "steamid": "42",
                        "personaname": "gordon",
                        "profileurl": "https://steamcommunity.com/id/gordon/",
                        "avatarfull": "https://avatars.example/gordon.jpg",
                        "communityvisibilitystate": 3
                    }
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let profile = client.get_player_profile("42").await.unwrap();

    assert_eq!(profile.personaname.as_deref(), Some("gordon"));
    assert!(profile.is_public());
}

#[tokio::test]
async fn retries_are_bounded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/IPlayerService/GetOwnedGames/v1/"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(4)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let err = client.get_owned_games("42").await.unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
}

#[tokio::test]
async fn permanent_failure_carries_status_and_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/IPlayerService/GetOwnedGames/v1/"))
        .respond_with(ResponseTemplate::new(403).set_body_string("<html>Forbidden</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let err = client.get_owned_games("42").await.unwrap_err();

    match err {
        CatalogError::Api {
            status,
            message,
            endpoint,
        } => {
            assert_eq!(status.as_u16(), 403);
            assert_eq!(message, "<html>Forbidden</html>");
            assert_eq!(endpoint, "/IPlayerService/GetOwnedGames/v1/");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn validate_api_key_reports_rejection() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ISteamWebAPIUtil/GetSupportedAPIList/v1/"))
        .and(query_param("key", "good-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "apilist": {} })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/ISteamWebAPIUtil/GetSupportedAPIList/v1/"))
        .and(query_param("key", "test-key"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let rejected = fast_client(&server);
    assert!(!rejected.validate_api_key().await.unwrap());

    let accepted = CatalogClient::with_base_url(&server.uri(), "good-key").unwrap();
    assert!(accepted.validate_api_key().await.unwrap());
}

#[tokio::test]
async fn get_game_details_unwraps_store_payload() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/appdetails"))
        .and(query_param("appids", "620"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "620": {
                "success": true,
                "data": {
                    "steam_appid": 620,
                    "name": "Portal 2",
                    "short_description": "The sequel.",
                    "header_image": "https://cdn.example/620/header.jpg",
                    "developers": ["Valve"],
                    "publishers": ["Valve"],
                    "genres": [{ "id": "1", "description": "Action" }, { "id": "25", "description": "Adventure" }],
                    "release_date": { "coming_soon": false, "date": "18 Apr, 2011" },
                    "metacritic": { "score": 95, "url": "https://www.metacritic.com/game/portal-2" }
                }
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/appdetails"))
        .and(query_param("appids", "999"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "999": { "success": false }
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let details = client.get_game_details(620).await.unwrap();
    assert_eq!(details.name, "Portal 2");
    assert_eq!(details.developers, vec!["Valve".to_string()]);
    assert_eq!(details.genres.len(), 2);
    assert_eq!(details.metacritic.map(|m| m.score), Some(95));

    let missing = client.get_game_details(999).await.unwrap_err();
    assert!(matches!(missing, CatalogError::NotFound { .. }));
}

#[tokio::test]
async fn get_game_reviews_reads_query_summary() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/appreviews/620"))
        .and(query_param("json", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": 1,
            "query_summary": {
                "num_reviews": 0,
                "review_score": 9,
                "review_score_desc": "Overwhelmingly Positive",
                "total_positive": 300_000,
                "total_negative": 3_000,
                "total_reviews": 303_000
            },
            "reviews": []
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let reviews = client.get_game_reviews(620).await.unwrap();

    assert_eq!(reviews.review_score, 9);
    assert_eq!(
        reviews.review_score_desc.as_deref(),
        Some("Overwhelmingly Positive")
    );
    assert_eq!(reviews.total_reviews, 303_000);
}
