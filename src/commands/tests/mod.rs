use crate::api::*;
use crate::commands::*;
use crate::migrate::MigrateStatus;
use crate::models::*;
use crate::protocols::Value;
use crate::test_fixtures::TestAgent;

#[test]
fn handshake_needs_no_token_but_everything_else_does() {
    let agent = TestAgent::new();

    let hs = handshake_command(&agent.state);
    assert_eq!(hs.token, crate::test_fixtures::TEST_TOKEN);
    assert_eq!(hs.port, 5175);
    assert_eq!(health_command().status, "ok");

    let denied = list_schemas_command(&agent.state, None);
    assert!(!denied.success);
    assert_eq!(denied.code.as_deref(), Some("PERMISSION_DENIED"));

    let denied = list_schemas_command(&agent.state, Some("wrong"));
    assert_eq!(denied.code.as_deref(), Some("PERMISSION_DENIED"));

    let ok = list_schemas_command(&agent.state, agent.token());
    assert!(ok.success);

    // bearer form is accepted
    let bearer = format!("Bearer {}", crate::test_fixtures::TEST_TOKEN);
    assert!(list_schemas_command(&agent.state, Some(&bearer)).success);
}

#[test]
fn schema_create_validates_fields() {
    let agent = TestAgent::new();
    let response = create_schema_command(
        &agent.state,
        agent.token(),
        CreateSchemaRequest {
            id: None,
            name: "LTPanel".into(),
            fields: vec![
                FieldRequest {
                    key: "r_current".into(),
                    dtype: Some("float".into()),
                    unit: Some("A".into()),
                    scale: Some(1.0),
                    description: None,
                },
                FieldRequest {
                    key: "r_current".into(),
                    dtype: Some("float".into()),
                    unit: None,
                    scale: None,
                    description: None,
                },
            ],
        },
    );
    assert!(!response.success);
    assert_eq!(response.code.as_deref(), Some("FIELD_KEY_DUPLICATE"));
}

#[test]
fn create_schema_then_migrate_then_replan_is_empty() {
    let agent = TestAgent::new();
    let table = agent.seed_panel_table("Transformer_1");

    let response = migrate_command(&agent.state, agent.token(), &[table.id.clone()]);
    assert!(response.success);
    let outcomes = response.data.unwrap().items;
    assert_eq!(outcomes[0].status, MigrateStatus::Created);
    assert_eq!(
        outcomes[0].operations,
        vec![
            "CREATE TABLE neuract__Transformer_1 (timestamp_utc DATETIME NOT NULL, r_current REAL, voltage REAL)",
            "CREATE INDEX IF NOT EXISTS idx_neuract__Transformer_1_ts ON neuract__Transformer_1(timestamp_utc)",
        ]
    );

    let response = dry_run_ddl_command(&agent.state, agent.token(), &[table.id.clone()]);
    assert!(response.data.unwrap().items[0].operations.is_empty());
}

#[test]
fn list_tables_merges_physical_only_entries() {
    let agent = TestAgent::new();
    let table = agent.seed_panel_table("Transformer_1");
    migrate_command(&agent.state, agent.token(), &[table.id.clone()]);

    let engine = agent.state.targets.engine_for_target(None).unwrap();
    engine
        .with_conn(|c| {
            c.execute("CREATE TABLE neuract__Orphan (timestamp_utc TEXT)", [])?;
            Ok(())
        })
        .unwrap();

    let response = list_tables_command(&agent.state, agent.token(), None);
    let items = response.data.unwrap().items;
    assert!(items.iter().any(|t| t.name == "Transformer_1"));
    let orphan = items.iter().find(|t| t.name == "Orphan").unwrap();
    assert_eq!(orphan.id, "phy_Orphan");
    assert_eq!(orphan.status, TableStatus::Migrated);
}

#[test]
fn device_create_runs_preflight() {
    let agent = TestAgent::new();

    agent.tags.refuse_connections(true);
    let refused = create_device_command(
        &agent.state,
        agent.token(),
        CreateDeviceRequest {
            id: None,
            name: "PLC-9".into(),
            protocol: "opcua".into(),
            params: serde_json::json!({"endpoint": "opc.tcp://10.0.0.9:4840"}),
            secrets: None,
            auto_reconnect: true,
        },
    );
    assert_eq!(refused.code.as_deref(), Some("TEST_FAILED"));
    assert!(agent.state.catalog.list_devices().is_empty());

    agent.tags.refuse_connections(false);
    let created = create_device_command(
        &agent.state,
        agent.token(),
        CreateDeviceRequest {
            id: None,
            name: "PLC-9".into(),
            protocol: "opcua".into(),
            params: serde_json::json!({"endpoint": "opc.tcp://10.0.0.9:4840"}),
            secrets: None,
            auto_reconnect: true,
        },
    );
    assert!(created.success);
    let first_id = created.data.unwrap().id;

    // case-insensitive name collision returns the existing device
    let again = create_device_command(
        &agent.state,
        agent.token(),
        CreateDeviceRequest {
            id: None,
            name: "plc-9".into(),
            protocol: "modbus".into(),
            params: serde_json::json!({"host": "10.0.0.9"}),
            secrets: None,
            auto_reconnect: true,
        },
    );
    assert_eq!(again.data.unwrap().id, first_id);
    assert_eq!(agent.state.catalog.list_devices().len(), 1);

    let bad = create_device_command(
        &agent.state,
        agent.token(),
        CreateDeviceRequest {
            id: None,
            name: "PLC-10".into(),
            protocol: "profinet".into(),
            params: serde_json::json!({}),
            secrets: None,
            auto_reconnect: true,
        },
    );
    assert_eq!(bad.code.as_deref(), Some("PROTOCOL_INVALID"));
}

#[test]
fn mapping_round_trip_through_commands() {
    let agent = TestAgent::new();
    let table = agent.seed_panel_table("Transformer_1");
    let device = agent.seed_connected_device();

    let mut rows = std::collections::HashMap::new();
    rows.insert(
        "r_current".to_string(),
        MappingRowRequest {
            protocol: Some("opcua".into()),
            address: None,
            node_id: Some("ns=2;s=Device1.Current".into()),
            data_type: None,
            scale: Some(0.1),
            deadband: None,
        },
    );
    let response = upsert_mapping_command(
        &agent.state,
        agent.token(),
        &table.id,
        MappingUpsertRequest {
            device_id: Some(device.id.clone()),
            rows,
        },
    );
    assert!(response.success);
    let mapping = response.data.unwrap();
    assert_eq!(mapping.health, MappingHealth::Partial);
    assert_eq!(mapping.rows["r_current"].address, "ns=2;s=Device1.Current");

    let fetched = get_mapping_command(&agent.state, agent.token(), &table.id);
    assert_eq!(fetched.data.unwrap().device_id, Some(device.id.clone()));

    let deleted = delete_mapping_row_command(&agent.state, agent.token(), &table.id, "r_current");
    assert!(deleted.data.unwrap().rows.is_empty());
}

#[test]
fn job_lifecycle_through_commands() {
    let agent = TestAgent::new();
    let table = agent.seed_panel_table("Transformer_1");
    migrate_command(&agent.state, agent.token(), &[table.id.clone()]);
    let device = agent.seed_connected_device();
    agent.seed_mapping(&table.id, &device.id);

    let created = create_job_command(
        &agent.state,
        agent.token(),
        CreateJobRequest {
            id: None,
            name: "J1".into(),
            job_type: Some("continuous".into()),
            tables: vec![table.id.clone()],
            columns: None,
            interval_ms: Some(20),
            enabled: false,
            batching: None,
            cpu_budget: None,
            triggers: vec![],
        },
    );
    assert!(created.success);
    let job_id = created.data.unwrap().id;

    let started = start_job_command(&agent.state, agent.token(), &job_id);
    assert_eq!(started.data.unwrap().status, JobStatus::Running);
    std::thread::sleep(std::time::Duration::from_millis(120));

    let stopped = stop_job_command(&agent.state, agent.token(), &job_id);
    assert_eq!(stopped.data.unwrap().status, JobStatus::Stopped);

    let metrics = job_metrics_command(&agent.state, agent.token(), &job_id, Some("60s"));
    let metrics = metrics.data.unwrap();
    assert!(metrics.summary.writes >= 2);
    assert!(!metrics.timeseries.is_empty());

    let runs = job_runs_command(&agent.state, agent.token(), &job_id, None, None);
    assert_eq!(runs.data.unwrap().items.len(), 1);

    // rows actually landed, with the 0.1 scale applied
    let engine = agent.state.targets.engine_for_target(None).unwrap();
    let (n, r_current): (i64, f64) = engine
        .with_conn(|c| {
            Ok(c.query_row(
                "SELECT COUNT(1), MAX(r_current) FROM neuract__Transformer_1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .unwrap();
    assert!(n >= 2);
    assert!((r_current - 1.0).abs() < 1e-9);

    let deleted = delete_job_command(&agent.state, agent.token(), &job_id);
    assert!(deleted.success);
    let again = delete_job_command(&agent.state, agent.token(), &job_id);
    assert_eq!(again.code.as_deref(), Some("JOB_NOT_FOUND"));
}

#[test]
fn job_create_preflight_codes_surface() {
    let agent = TestAgent::new();
    let table = agent.seed_panel_table("Transformer_1");

    let no_tables = create_job_command(
        &agent.state,
        agent.token(),
        CreateJobRequest {
            id: None,
            name: "J".into(),
            job_type: None,
            tables: vec![],
            columns: None,
            interval_ms: None,
            enabled: false,
            batching: None,
            cpu_budget: None,
            triggers: vec![],
        },
    );
    assert_eq!(no_tables.code.as_deref(), Some("NO_TABLES"));

    let unmapped = create_job_command(
        &agent.state,
        agent.token(),
        CreateJobRequest {
            id: None,
            name: "J".into(),
            job_type: None,
            tables: vec![table.id.clone()],
            columns: None,
            interval_ms: None,
            enabled: false,
            batching: None,
            cpu_budget: None,
            triggers: vec![],
        },
    );
    assert_eq!(unmapped.code.as_deref(), Some("NO_MAPPED_COLUMNS"));
}

#[test]
fn trigger_job_with_cooldown_suppresses_refires() {
    let agent = TestAgent::new();
    let table = agent.seed_panel_table("Transformer_1");
    migrate_command(&agent.state, agent.token(), &[table.id.clone()]);
    let device = agent.seed_connected_device();
    agent.seed_mapping(&table.id, &device.id);
    // scaled r_current = 1.0 > 0.5 on every tick
    agent.tags.set("ns=2;s=Device1.Current", Value::I64(10));

    let created = create_job_command(
        &agent.state,
        agent.token(),
        CreateJobRequest {
            id: None,
            name: "J2".into(),
            job_type: Some("trigger".into()),
            tables: vec![table.id.clone()],
            columns: None,
            interval_ms: Some(20),
            enabled: false,
            batching: None,
            cpu_budget: None,
            triggers: vec![TriggerRequest {
                table_id: table.id.clone(),
                field_key: "r_current".into(),
                op: ">".into(),
                value: Some(0.5),
                deadband: None,
                cooldown_ms: Some(3_600_000),
            }],
        },
    );
    let job_id = created.data.unwrap().id;
    start_job_command(&agent.state, agent.token(), &job_id);
    std::thread::sleep(std::time::Duration::from_millis(150));
    stop_job_command(&agent.state, agent.token(), &job_id);

    let engine = agent.state.targets.engine_for_target(None).unwrap();
    let n: i64 = engine
        .with_conn(|c| {
            Ok(c.query_row(
                "SELECT COUNT(1) FROM neuract__Transformer_1",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(n, 1, "cooldown allows exactly one row");

    let metrics = job_metrics_command(&agent.state, agent.token(), &job_id, Some("60s"))
        .data
        .unwrap();
    assert!(metrics.summary.fires >= 2);
    assert!(metrics.summary.suppressed >= 1);
}

#[test]
fn system_summary_reflects_state() {
    let agent = TestAgent::new();
    let summary = system_summary_command(&agent.state, agent.token())
        .data
        .unwrap();
    assert_eq!(summary.devices_connected, 0);
    assert!(!summary.default_db_ok);
    assert_eq!(summary.jobs_running, 0);

    agent.seed_panel_table("T1");
    agent.seed_connected_device();
    let target_id = agent.state.catalog.default_target_id().unwrap();
    test_target_command(&agent.state, agent.token(), Some(&target_id), None);

    let summary = system_summary_command(&agent.state, agent.token())
        .data
        .unwrap();
    assert_eq!(summary.devices_connected, 1);
    assert!(summary.default_db_ok);
}

#[test]
fn gateway_commands_enforce_rules() {
    let agent = TestAgent::new();
    let bad_port = create_gateway_command(
        &agent.state,
        agent.token(),
        CreateGatewayRequest {
            id: None,
            name: "gw1".into(),
            host: "127.0.0.1".into(),
            adapter_id: None,
            nic_hint: None,
            ports: vec![70000],
            protocol_hint: None,
            tags: vec![],
        },
    );
    assert_eq!(bad_port.code.as_deref(), Some("INVALID_PORTS"));

    let created = create_gateway_command(
        &agent.state,
        agent.token(),
        CreateGatewayRequest {
            id: None,
            name: "gw1".into(),
            host: "127.0.0.1".into(),
            adapter_id: None,
            nic_hint: None,
            ports: vec![1],
            protocol_hint: None,
            tags: vec![],
        },
    );
    let gateway = created.data.unwrap();

    // first test consumes the 3s budget, second is rate limited
    let first = tcp_gateway_command(
        &agent.state,
        agent.token(),
        &gateway.id,
        Some(vec![1]),
        Some(50),
    );
    assert!(first.success);
    let second = tcp_gateway_command(
        &agent.state,
        agent.token(),
        &gateway.id,
        Some(vec![1]),
        Some(50),
    );
    assert_eq!(second.code.as_deref(), Some("RATE_LIMITED"));
}

#[test]
fn device_secrets_are_sealed_and_redacted() {
    let agent = TestAgent::new();
    let created = create_device_command(
        &agent.state,
        agent.token(),
        CreateDeviceRequest {
            id: None,
            name: "PLC-S".into(),
            protocol: "opcua".into(),
            params: serde_json::json!({"endpoint": "opc.tcp://10.0.0.9:4840", "password": "hunter2"}),
            secrets: Some(serde_json::json!({"user": "admin", "pass": "hunter2"})),
            auto_reconnect: true,
        },
    );
    assert!(created.success);
    let device = created.data.unwrap();
    // outward copy carries neither the sealed blob nor plain params
    assert!(device.secrets_sealed.is_none());
    assert_eq!(device.params["password"], "***");

    // the stored blob opens back to the original credentials
    let raw = agent
        .state
        .catalog
        .get_device_raw(&device.id)
        .unwrap()
        .secrets_sealed
        .unwrap();
    let opened = agent.state.secret_box.open(&raw).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&opened).unwrap();
    assert_eq!(parsed["pass"], "hunter2");
}
