//! Admin resources exposed by the main backend.

use clap::ValueEnum;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;

use super::client::{decode, ApiClient, ApiResponse};
use crate::offline::{OfflineStorage, Transport};

/// Collections managed from the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResourceKind {
  Categories,
  TestSeries,
  Tests,
  LiveTests,
  DailyTests,
  Questions,
  CurrentAffairs,
}

impl ResourceKind {
  /// Collection path relative to the API base URL.
  pub fn path(self) -> &'static str {
    match self {
      ResourceKind::Categories => "categories",
      ResourceKind::TestSeries => "test-series",
      ResourceKind::Tests => "tests",
      ResourceKind::LiveTests => "live-tests",
      ResourceKind::DailyTests => "daily-tests",
      ResourceKind::Questions => "questions",
      ResourceKind::CurrentAffairs => "current-affairs",
    }
  }

  pub fn item_path(self, id: &str) -> String {
    format!("{}/{}", self.path(), id)
  }
}

/// A test category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub name: String,
  pub description: String,
  pub icon: String,
  /// Gradient stops
  pub color: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tests_count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
}

/// Typed CRUD over one collection.
pub struct Resource<'a, S, T, R> {
  client: &'a ApiClient<S, T>,
  kind: ResourceKind,
  _marker: PhantomData<R>,
}

impl<'a, S, T, R> Resource<'a, S, T, R>
where
  S: OfflineStorage + 'static,
  T: Transport + 'static,
  R: DeserializeOwned + Serialize,
{
  pub fn new(client: &'a ApiClient<S, T>, kind: ResourceKind) -> Self {
    Self {
      client,
      kind,
      _marker: PhantomData,
    }
  }

  pub async fn list(&self) -> Result<ApiResponse<Vec<R>>> {
    self.client.get(self.kind.path()).await?.try_map(decode)
  }

  pub async fn get(&self, id: &str) -> Result<ApiResponse<R>> {
    self.client.get(&self.kind.item_path(id)).await?.try_map(decode)
  }

  pub async fn create(&self, item: &R) -> Result<ApiResponse<R>> {
    let body = serde_json::to_value(item)?;
    self.client.post(self.kind.path(), body).await?.try_map(decode)
  }

  pub async fn update(&self, id: &str, item: &R) -> Result<ApiResponse<R>> {
    let body = serde_json::to_value(item)?;
    self
      .client
      .put(&self.kind.item_path(id), body)
      .await?
      .try_map(decode)
  }

  /// Delete returns the backend's acknowledgement untouched.
  pub async fn delete(&self, id: &str) -> Result<ApiResponse<Value>> {
    self.client.delete(&self.kind.item_path(id)).await
  }
}

impl<S, T> ApiClient<S, T>
where
  S: OfflineStorage + 'static,
  T: Transport + 'static,
{
  pub fn categories(&self) -> Resource<'_, S, T, Category> {
    Resource::new(self, ResourceKind::Categories)
  }

  /// Untyped access to any collection.
  pub fn resource(&self, kind: ResourceKind) -> Resource<'_, S, T, Value> {
    Resource::new(self, kind)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::auth::SessionTokens;
  use crate::offline::testing::{Reply, ScriptedTransport};
  use crate::offline::{Connectivity, OfflineService, SqliteStorage, SyncPolicy};
  use serde_json::json;
  use std::sync::Arc;

  fn client(online: bool) -> (ApiClient<SqliteStorage, ScriptedTransport>, Arc<ScriptedTransport>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let transport = Arc::new(ScriptedTransport::new());
    let tokens = Arc::new(SessionTokens::new(Arc::clone(&storage), None));
    let offline = Arc::new(OfflineService::new(
      storage,
      Arc::clone(&transport),
      Connectivity::new(online),
      SyncPolicy::default(),
      None,
    ));
    let client = ApiClient::new("http://backend/api", Arc::clone(&transport), offline, tokens);
    (client.unwrap(), transport)
  }

  fn physics() -> Category {
    Category {
      id: None,
      name: "Physics".into(),
      description: "Mechanics and optics".into(),
      icon: "atom".into(),
      color: vec!["#111".into(), "#222".into()],
      tests_count: None,
      status: None,
    }
  }

  #[test]
  fn test_resource_paths() {
    assert_eq!(ResourceKind::TestSeries.path(), "test-series");
    assert_eq!(ResourceKind::CurrentAffairs.item_path("9"), "current-affairs/9");
  }

  #[test]
  fn test_category_uses_camel_case() {
    let category: Category = serde_json::from_value(json!({
      "id": "c1",
      "name": "Physics",
      "description": "",
      "icon": "atom",
      "color": ["#111"],
      "testsCount": 4
    }))
    .unwrap();
    assert_eq!(category.tests_count, Some(4));
    assert_eq!(category.status, None);
  }

  #[tokio::test]
  async fn test_list_categories_decodes() {
    let (client, transport) = client(true);
    transport.reply(
      "http://backend/api/categories",
      Reply::Json(200, json!([serde_json::to_value(physics()).unwrap()])),
    );

    let response = client.categories().list().await.unwrap();

    assert_eq!(response, ApiResponse::Network(vec![physics()]));
  }

  #[tokio::test]
  async fn test_create_offline_is_queued() {
    let (client, _transport) = client(false);

    let response = client.categories().create(&physics()).await.unwrap();

    let ApiResponse::Queued(action) = response else {
      panic!("expected queued response");
    };
    assert_eq!(action.url, "http://backend/api/categories");
    assert_eq!(action.payload.unwrap()["name"], "Physics");
  }
}
