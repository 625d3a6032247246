use serde::Deserialize;
use tracing::{debug, warn};

use crate::build_http_client;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::CountryRecord;

/// Read-only client for the full country dataset.
#[derive(Clone)]
pub struct CountryDirectory {
    http: reqwest::Client,
    endpoint: String,
}

impl CountryDirectory {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            http: build_http_client(config.http_timeout_secs)?,
            endpoint: config.directory_endpoint.clone(),
        })
    }

    pub async fn fetch_all(&self) -> AppResult<Vec<CountryRecord>> {
        #[derive(Deserialize)]
        struct RawCountry {
            cca2: String,
            name: RawName,
            #[serde(default)]
            capital: Vec<String>,
            flags: Option<RawFlags>,
        }

        #[derive(Deserialize)]
        struct RawName {
            common: String,
        }

        #[derive(Deserialize)]
        struct RawFlags {
            png: Option<String>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| AppError::DirectoryUnavailable(err.to_string()))?;
        let raw: Vec<RawCountry> = response
            .json()
            .await
            .map_err(|err| AppError::DirectoryUnavailable(err.to_string()))?;

        let countries = raw
            .into_iter()
            .map(|country| CountryRecord {
                code: country.cca2,
                common_name: country.name.common,
                capital: country.capital.into_iter().next(),
                flag_url: country.flags.and_then(|flags| flags.png).unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        debug!(target: "directory", count = countries.len(), "country directory fetched");
        Ok(countries)
    }

    /// Fetch-then-filter; any failure shows as no results.
    pub async fn search(&self, query: &str) -> Vec<CountryRecord> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        match self.fetch_all().await {
            Ok(dataset) => filter(Some(&dataset), query),
            Err(err) => {
                warn!(target: "directory", error = %err, "country search failed");
                filter(None, query)
            }
        }
    }
}

/// Case-insensitive substring match on the common name or first capital.
/// A blank query, or a missing dataset, yields nothing. The query is matched
/// as typed, surrounding whitespace included.
pub fn filter(dataset: Option<&[CountryRecord]>, query: &str) -> Vec<CountryRecord> {
    if query.trim().is_empty() {
        return Vec::new();
    }
    let needle = query.to_lowercase();
    let Some(dataset) = dataset else {
        return Vec::new();
    };
    dataset
        .iter()
        .filter(|country| {
            country.common_name.to_lowercase().contains(&needle)
                || country
                    .capital
                    .as_deref()
                    .map(|capital| capital.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use httptest::matchers::request;
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    fn country(code: &str, name: &str, capital: Option<&str>) -> CountryRecord {
        CountryRecord {
            code: code.into(),
            common_name: name.into(),
            capital: capital.map(str::to_string),
            flag_url: format!("https://flagcdn.com/w320/{}.png", code.to_lowercase()),
        }
    }

    fn dataset() -> Vec<CountryRecord> {
        vec![
            country("IT", "Italy", Some("Rome")),
            country("DE", "Germany", Some("Berlin")),
            country("AQ", "Antarctica", None),
            country("RO", "Romania", Some("Bucharest")),
        ]
    }

    #[test]
    fn empty_query_yields_nothing() {
        let data = dataset();
        assert!(filter(Some(&data), "").is_empty());
        assert!(filter(Some(&data), "   ").is_empty());
    }

    #[test]
    fn matches_name_or_capital_case_insensitively() {
        let data = dataset();
        let names: Vec<_> = filter(Some(&data), "ROM")
            .into_iter()
            .map(|c| c.common_name)
            .collect();
        assert_eq!(names, vec!["Italy", "Romania"]);

        let by_capital = filter(Some(&data), "berl");
        assert_eq!(by_capital.len(), 1);
        assert_eq!(by_capital[0].code, "DE");
    }

    #[test]
    fn surrounding_whitespace_is_part_of_the_query() {
        let data = dataset();
        assert!(filter(Some(&data), " rom").is_empty());
        assert_eq!(filter(Some(&data), "ital").len(), 1);
        assert!(filter(Some(&data), "ital ").is_empty());
    }

    #[test]
    fn absent_dataset_yields_nothing() {
        assert!(filter(None, "Italy").is_empty());
    }

    fn directory(server: &Server) -> CountryDirectory {
        CountryDirectory::new(&AppConfig {
            directory_endpoint: server.url_str("/v3.1/all"),
            ..AppConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetches_and_flattens_dataset() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v3.1/all")).respond_with(
                json_encoded(json!([
                    {
                        "cca2": "IT",
                        "name": { "common": "Italy", "official": "Italian Republic" },
                        "capital": ["Rome"],
                        "flags": { "png": "https://flagcdn.com/w320/it.png" }
                    },
                    {
                        "cca2": "AQ",
                        "name": { "common": "Antarctica" },
                        "flags": { "png": "https://flagcdn.com/w320/aq.png" }
                    }
                ])),
            ),
        );

        let countries = directory(&server).fetch_all().await.unwrap();
        assert_eq!(countries.len(), 2);
        assert_eq!(countries[0].capital.as_deref(), Some("Rome"));
        assert_eq!(countries[1].capital, None);
    }

    #[tokio::test]
    async fn unavailable_directory_is_reported_and_search_is_empty() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v3.1/all"))
                .times(2)
                .respond_with(status_code(502)),
        );

        let client = directory(&server);
        assert!(matches!(
            client.fetch_all().await,
            Err(AppError::DirectoryUnavailable(_))
        ));
        assert!(client.search("Italy").await.is_empty());
    }
}
