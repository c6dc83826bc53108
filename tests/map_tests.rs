//! Map operations against an in-process store.

use std::time::Duration;

use kvgrid::server::{ServerConfig, StoreServer};
use kvgrid::{Error, GridClient, Json};
use serde::{Deserialize, Serialize};

async fn start() -> (StoreServer, GridClient) {
  let server = StoreServer::bind("127.0.0.1:0", ServerConfig::default())
    .await
    .unwrap();
  let client = GridClient::connect_to(&server.address()).await.unwrap();
  (server, client)
}

#[tokio::test]
async fn test_put_then_get() {
  let (_server, client) = start().await;
  let map = client.get_map::<String, String>("map");

  map.put(&"key".to_string(), &"value".to_string()).await.unwrap();
  assert_eq!(
    map.get(&"key".to_string()).await.unwrap(),
    Some("value".to_string())
  );

  map.put(&"key".to_string(), &"other".to_string()).await.unwrap();
  assert_eq!(
    map.get(&"key".to_string()).await.unwrap(),
    Some("other".to_string())
  );
  client.close().await;
}

#[tokio::test]
async fn test_absent_key_is_none() {
  let (_server, client) = start().await;
  let map = client.get_map::<String, String>("map");
  assert_eq!(map.get(&"missing".to_string()).await.unwrap(), None);
  assert!(!map.contains_key(&"missing".to_string()).await.unwrap());
  assert_eq!(map.remove(&"missing".to_string()).await.unwrap(), None);
  client.close().await;
}

#[tokio::test]
async fn test_size_after_distinct_puts() {
  let (_server, client) = start().await;
  let map = client.get_map::<String, String>("map");
  for i in 0..100 {
    map.put(&format!("key_{i}"), &format!("value_{i}")).await.unwrap();
  }
  assert_eq!(map.size().await.unwrap(), 100);

  map.put(&"key_0".to_string(), &"again".to_string()).await.unwrap();
  assert_eq!(map.size().await.unwrap(), 100);
  client.close().await;
}

#[tokio::test]
async fn test_remove_returns_previous_value() {
  let (_server, client) = start().await;
  let map = client.get_map::<i32, i64>("numbers");
  map.put(&1, &10).await.unwrap();
  assert!(map.contains_key(&1).await.unwrap());
  assert_eq!(map.remove(&1).await.unwrap(), Some(10));
  assert!(!map.contains_key(&1).await.unwrap());
  assert_eq!(map.size().await.unwrap(), 0);
  client.close().await;
}

#[tokio::test]
async fn test_maps_are_independent() {
  let (_server, client) = start().await;
  let a = client.get_map::<String, String>("a");
  let b = client.get_map::<String, String>("b");
  a.put(&"k".to_string(), &"in a".to_string()).await.unwrap();
  assert_eq!(b.get(&"k".to_string()).await.unwrap(), None);
  assert_eq!(a.name(), "a");
  client.close().await;
}

#[tokio::test]
async fn test_optional_values() {
  let (_server, client) = start().await;
  let map = client.get_map::<String, Option<String>>("optional");
  map.put(&"none".to_string(), &None).await.unwrap();
  map
    .put(&"some".to_string(), &Some("x".to_string()))
    .await
    .unwrap();
  assert!(map.contains_key(&"none".to_string()).await.unwrap());
  assert_eq!(
    map.get(&"some".to_string()).await.unwrap(),
    Some(Some("x".to_string()))
  );
  client.close().await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Country {
  name: String,
  population: i64,
}

#[tokio::test]
async fn test_json_values() {
  let (_server, client) = start().await;
  let map = client.get_map::<String, Json<Country>>("countries");
  let brazil = Country {
    name: "Brazil".to_string(),
    population: 203_080_756,
  };
  map.put(&"BR".to_string(), &Json(brazil.clone())).await.unwrap();
  assert_eq!(
    map.get(&"BR".to_string()).await.unwrap(),
    Some(Json(brazil))
  );
  client.close().await;
}

#[tokio::test]
async fn test_concurrent_operations_share_one_session() {
  let (server, client) = start().await;
  let mut tasks = Vec::new();
  for t in 0..8 {
    let map = client.get_map::<String, i32>("shared");
    tasks.push(tokio::spawn(async move {
      for i in 0..25 {
        map.put(&format!("{t}-{i}"), &i).await.unwrap();
      }
    }));
  }
  for task in tasks {
    task.await.unwrap();
  }
  assert_eq!(client.get_map::<String, i32>("shared").size().await.unwrap(), 200);
  assert_eq!(server.store().size("shared"), 200);
  client.close().await;
}

#[tokio::test]
async fn test_oversized_value_fails_without_waiting_for_timeout() {
  let (_server, client) = start().await;
  let map = client.get_map::<String, String>("map");
  let huge = "x".repeat(17 * 1024 * 1024);

  let result = tokio::time::timeout(Duration::from_secs(2), map.put(&"k".to_string(), &huge))
    .await
    .expect("oversized put should fail immediately");
  assert!(matches!(result, Err(Error::Serialization(_))), "got {result:?}");

  map.put(&"k".to_string(), &"small".to_string()).await.unwrap();
  assert_eq!(map.get(&"k".to_string()).await.unwrap(), Some("small".to_string()));
  client.close().await;
}
