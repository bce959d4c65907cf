use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use concierge::engine::Engine;
use concierge::notify::NotifyHub;
use concierge::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("concierge_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("concierge.wal"), Arc::new(NotifyHub::new())).unwrap());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("concierge")
        .user("concierge");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn insert_sql(id: Ulid, resident: &str, amenity: &str, date: &str, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO bookings (id, resident_id, resident_name, resident_email, amenity_id, booking_date, start_time, end_time) \
         VALUES ('{id}', '{resident}', 'Resident {resident}', '{resident}@example.com', '{amenity}', '{date}', '{start}', '{end}')"
    )
}

/// Data rows from a simple query, as column → value lookups.
async fn select_rows(client: &tokio_postgres::Client, sql: &str) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_and_select_booking() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new();
    client
        .batch_execute(&insert_sql(id, "R1", "A1", "2024-03-10", "14:00", "15:00"))
        .await
        .unwrap();

    let rows = select_rows(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get("resident_id"), Some("R1"));
    assert_eq!(row.get("resident_name"), Some("Resident R1"));
    assert_eq!(row.get("resident_email"), Some("R1@example.com"));
    assert_eq!(row.get("booking_date"), Some("2024-03-10"));
    assert_eq!(row.get("booking_time"), Some("14:00-15:00"));
    assert_eq!(row.get("status"), Some("Pending"));
    assert_eq!(row.get("starts_at"), Some("2024-03-10T14:00:00"));
}

#[tokio::test]
async fn overlap_reports_exclusion_violation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql(Ulid::new(), "R2", "A1", "2024-03-10", "14:30", "15:30"))
        .await
        .unwrap();
    let err = client
        .batch_execute(&insert_sql(Ulid::new(), "R1", "A1", "2024-03-10", "14:00", "15:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
}

#[tokio::test]
async fn consecutive_days_report_check_violation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    for date in ["2024-01-01", "2024-01-02"] {
        client
            .batch_execute(&insert_sql(Ulid::new(), "R1", "bbq", date, "18:00", "20:00"))
            .await
            .unwrap();
    }
    let err = client
        .batch_execute(&insert_sql(Ulid::new(), "R1", "bbq", "2024-01-03", "18:00", "20:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23514"));
}

#[tokio::test]
async fn malformed_time_is_invalid_parameter() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let err = client
        .batch_execute(&insert_sql(Ulid::new(), "R1", "A1", "2024-03-10", "2pm", "15:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client
        .batch_execute(&insert_sql(Ulid::new(), "R1", "A1", "10/03/2024", "14:00", "15:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22007"));

    let err = client
        .simple_query("SELECT * FROM bookings WHERE booking_date = '2024-02-30'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22007"));
}

#[tokio::test]
async fn contact_required_and_validated() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let err = client
        .batch_execute(
            "INSERT INTO bookings (resident_id, resident_email, amenity_id, booking_date, start_time, end_time) \
             VALUES ('R1', 'r1@example.com', 'pool', '2024-03-10', '09:00', '10:00')",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client
        .batch_execute(
            "INSERT INTO bookings (resident_id, resident_name, resident_email, amenity_id, booking_date, start_time, end_time) \
             VALUES ('R1', 'Ruth', 'ruth-at-example.com', 'pool', '2024-03-10', '09:00', '10:00')",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
    assert_eq!(engine.amenity_count(), 0);

    let id = Ulid::new();
    client
        .batch_execute(&insert_sql(id, "R1", "pool", "2024-03-10", "09:00", "10:00"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE bookings SET resident_email = 'ruth@example.org', status = 'confirmed' WHERE id = '{id}'"
        ))
        .await
        .unwrap();
    let record = engine.get_booking(id).await.unwrap();
    assert_eq!(record.resident_email, "ruth@example.org");
    assert_eq!(record.status.as_str(), "Confirmed");

    let err = client
        .batch_execute(&format!("UPDATE bookings SET resident_email = 'nope' WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn update_status_and_reschedule() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new();
    client
        .batch_execute(&insert_sql(id, "R1", "gym", "2024-03-10", "09:00", "10:00"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{id}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE bookings SET booking_time = '11:00 to 12:00' WHERE id = '{id}'"))
        .await
        .unwrap();

    let record = engine.get_booking(id).await.unwrap();
    assert_eq!(record.status.as_str(), "Confirmed");
    assert_eq!(record.slot.label(), "11:00-12:00");

    let err = client
        .batch_execute(&format!("UPDATE bookings SET resident_id = 'R9' WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42703"));
}

#[tokio::test]
async fn delete_then_missing() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new();
    client
        .batch_execute(&insert_sql(id, "R1", "pool", "2024-03-10", "09:00", "10:00"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();

    assert!(select_rows(&client, "SELECT * FROM bookings WHERE amenity_id = 'pool'").await.is_empty());
    let err = client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO bookings (id, resident_id, resident_name, resident_email, amenity_id, booking_date, start_time, end_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[&id, &"R1", &"Ruth", &"ruth@example.com", &"hall", &"2024-03-10", &"18:00", &"20:00"],
        )
        .await
        .unwrap();

    let rows = client
        .query("SELECT * FROM bookings WHERE amenity_id = $1", &[&"hall"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let label: String = rows[0].get("booking_time");
    assert_eq!(label, "18:00-20:00");
    let got_id: String = rows[0].get("id");
    assert_eq!(got_id, id);
}

#[tokio::test]
async fn bound_values_containing_placeholders_stay_literal() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO bookings (id, resident_id, resident_name, resident_email, amenity_id, booking_date, start_time, end_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[&id, &"unit$1", &"O'Hara $4", &"ohara@example.com", &"pool", &"2024-03-10", &"09:00", &"10:00"],
        )
        .await
        .unwrap();

    let stored = engine.bookings_for_resident("unit$1").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id.to_string(), id);
    assert_eq!(stored[0].resident_name, "O'Hara $4");

    let rows = client
        .query("SELECT * FROM bookings WHERE resident_id = $1", &[&"unit$1"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let amenity: String = rows[0].get("amenity_id");
    assert_eq!(amenity, "pool");
}
