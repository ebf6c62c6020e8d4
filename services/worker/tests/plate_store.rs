//! PostgreSQL-backed store tests. Run with `DATABASE_URL` set and
//! `cargo test -- --ignored`.

use chrono::{DateTime, TimeZone, Utc};
use plate_worker::{PgPlateStore, PlateObservation, PlateStore, VehicleAttributes};
use sqlx::PgPool;
use std::sync::Arc;

fn at(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, secs).unwrap()
}

fn observation(plate: &str, captured_at: DateTime<Utc>) -> PlateObservation {
    PlateObservation {
        plate: plate.to_string(),
        captured_at,
        image: None,
        attributes: None,
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn repeat_sightings_share_one_row(pool: PgPool) {
    let store = PgPlateStore::from_pool(pool.clone());

    let first = store.record_observation(&observation("AB12CDE", at(10))).await.unwrap();
    let second = store.record_observation(&observation("AB12CDE", at(40))).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.capture_time, at(10));
    assert_eq!(second.recent_capture_time, at(40));

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM license_plates")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn late_delivery_keeps_time_bounds(pool: PgPool) {
    let store = PgPlateStore::from_pool(pool);

    store.record_observation(&observation("AB12CDE", at(30))).await.unwrap();
    let record = store.record_observation(&observation("AB12CDE", at(5))).await.unwrap();

    assert_eq!(record.capture_time, at(5));
    assert_eq!(record.recent_capture_time, at(30));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn details_survive_sightings_without_them(pool: PgPool) {
    let store = PgPlateStore::from_pool(pool);

    let enriched = PlateObservation {
        image: Some("/9j/4AAQ".to_string()),
        attributes: Some(VehicleAttributes {
            make: Some("FORD".to_string()),
            color: Some("BLUE".to_string()),
            year_of_manufacture: Some(2015),
            ..Default::default()
        }),
        ..observation("AB12CDE", at(0))
    };
    store.record_observation(&enriched).await.unwrap();
    let record = store.record_observation(&observation("AB12CDE", at(20))).await.unwrap();

    assert_eq!(record.car_make.as_deref(), Some("FORD"));
    assert_eq!(record.car_color.as_deref(), Some("BLUE"));
    assert_eq!(record.year_of_manufacture, Some(2015));
    assert_eq!(record.image_url.as_deref(), Some("/9j/4AAQ"));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_sightings_do_not_duplicate(pool: PgPool) {
    let store = Arc::new(PgPlateStore::from_pool(pool.clone()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.record_observation(&observation("AB12CDE", at(i))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = store.get_plate("AB12CDE").await.unwrap().unwrap();
    assert_eq!(record.capture_time, at(0));
    assert_eq!(record.recent_capture_time, at(7));

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM license_plates")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn writes_bump_last_update_marker(pool: PgPool) {
    let store = PgPlateStore::from_pool(pool);
    assert!(store.last_update().await.unwrap().is_none());

    store.record_observation(&observation("AB12CDE", at(0))).await.unwrap();
    let after_insert = store.last_update().await.unwrap().unwrap();

    assert!(store.attach_video("AB12CDE", "AB12CDE_clip.mp4", at(0)).await.unwrap());
    let after_attach = store.last_update().await.unwrap().unwrap();
    assert!(after_attach >= after_insert);

    let record = store.get_plate("AB12CDE").await.unwrap().unwrap();
    assert_eq!(record.video_url.as_deref(), Some("AB12CDE_clip.mp4"));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn attach_video_to_unknown_plate(pool: PgPool) {
    let store = PgPlateStore::from_pool(pool);
    assert!(!store.attach_video("ZZ99ZZZ", "clip.mp4", at(0)).await.unwrap());
    assert!(store.last_update().await.unwrap().is_none());
    store.ping().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn older_clip_does_not_replace_newer(pool: PgPool) {
    let store = PgPlateStore::from_pool(pool);
    store.record_observation(&observation("AB12CDE", at(0))).await.unwrap();
    store.record_observation(&observation("AB12CDE", at(10))).await.unwrap();

    assert!(store.attach_video("AB12CDE", "newer.mp4", at(10)).await.unwrap());
    let marker = store.last_update().await.unwrap();
    assert!(!store.attach_video("AB12CDE", "older.mp4", at(0)).await.unwrap());
    assert_eq!(store.last_update().await.unwrap(), marker);

    let record = store.get_plate("AB12CDE").await.unwrap().unwrap();
    assert_eq!(record.video_url.as_deref(), Some("newer.mp4"));
    assert_eq!(record.video_captured_at, Some(at(10)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn long_colour_and_fuel_descriptions_fit(pool: PgPool) {
    let store = PgPlateStore::from_pool(pool);
    let color = "METALLIC DARK BLUE WITH SILVER PEARL FINISH";
    let fuel = "HYBRID ELECTRIC (PETROL) PLUG-IN RANGE EXT";
    assert!(color.len() > 30 && color.len() <= 50);
    assert!(fuel.len() > 20 && fuel.len() <= 50);

    let detailed = PlateObservation {
        attributes: Some(VehicleAttributes {
            color: Some(color.to_string()),
            fuel_type: Some(fuel.to_string()),
            ..Default::default()
        }),
        ..observation("AB12CDE", at(0))
    };
    let record = store.record_observation(&detailed).await.unwrap();

    assert_eq!(record.car_color.as_deref(), Some(color));
    assert_eq!(record.fuel_type.as_deref(), Some(fuel));
}
