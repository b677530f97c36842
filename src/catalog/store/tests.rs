use super::*;
use crate::catalog::appdb::AppDb;
use assert_matches::assert_matches;

fn store() -> CatalogStore {
    CatalogStore::new(Arc::new(AppDb::open_in_memory().unwrap())).unwrap()
}

fn sample_fields() -> Vec<Field> {
    vec![
        Field {
            key: "r_current".into(),
            dtype: FieldType::Float,
            unit: Some("A".into()),
            scale: Some(1.0),
            description: None,
        },
        Field {
            key: "voltage".into(),
            dtype: FieldType::Float,
            unit: Some("V".into()),
            scale: Some(1.0),
            description: None,
        },
    ]
}

fn opcua_row(node: &str) -> MappingRow {
    MappingRow {
        protocol: Protocol::Opcua,
        address: node.into(),
        data_type: None,
        scale: None,
        deadband: None,
    }
}

#[test]
fn restart_reproduces_catalog_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");

    let db = Arc::new(AppDb::open(&path).unwrap());
    let store = CatalogStore::new(db).unwrap();
    let schema = store
        .create_schema(None, "LTPanel", sample_fields())
        .unwrap();
    let (tables, warnings) = store
        .add_tables_bulk(&schema.id, &["Transformer_1".into()], None)
        .unwrap();
    assert!(warnings.is_empty());
    let target = store
        .add_target(None, DbProvider::Sqlite, ":memory:", None, None)
        .unwrap();
    store.set_default_target(&target.id).unwrap();
    store
        .add_device(
            None,
            "PLC-1",
            Protocol::Opcua,
            serde_json::json!({"endpoint": "opc.tcp://127.0.0.1:4840"}),
            None,
            true,
        )
        .unwrap();

    // fresh store over the same file sees the same entities
    let db2 = Arc::new(AppDb::open(&path).unwrap());
    let reloaded = CatalogStore::new(db2).unwrap();
    assert_eq!(reloaded.list_schemas().len(), 1);
    assert_eq!(reloaded.list_schemas()[0].fields.len(), 2);
    assert_eq!(reloaded.list_tables().len(), 1);
    assert_eq!(reloaded.list_tables()[0].id, tables[0].id);
    assert_eq!(reloaded.default_target_id(), Some(target.id));
    assert_eq!(reloaded.list_devices().len(), 1);
}

#[test]
fn target_add_or_reuse_by_provider_and_conn() {
    let store = store();
    let a = store
        .add_target(None, DbProvider::Sqlite, "/tmp/data.db", None, None)
        .unwrap();
    let b = store
        .add_target(
            None,
            DbProvider::Sqlite,
            "/TMP/DATA.DB",
            Some(TargetStatus::Ok),
            Some("Test OK".into()),
        )
        .unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(b.status, TargetStatus::Ok);
    assert_eq!(store.list_targets().0.len(), 1);
}

#[test]
fn default_and_referenced_targets_cannot_be_deleted() {
    let store = store();
    let schema = store.create_schema(None, "S", sample_fields()).unwrap();
    let t1 = store
        .add_target(None, DbProvider::Sqlite, "a.db", None, None)
        .unwrap();
    let t2 = store
        .add_target(None, DbProvider::Sqlite, "b.db", None, None)
        .unwrap();
    store.set_default_target(&t1.id).unwrap();
    assert_matches!(
        store.delete_target(&t1.id),
        Err(AppError::TargetIsDefault { .. })
    );

    store
        .add_tables_bulk(&schema.id, &["T1".into()], Some(t2.id.clone()))
        .unwrap();
    assert_matches!(
        store.delete_target(&t2.id),
        Err(AppError::TargetInUse { .. })
    );
}

#[test]
fn device_name_collision_returns_existing() {
    let store = store();
    let a = store
        .add_device(None, "Press-1", Protocol::Modbus, serde_json::json!({}), None, true)
        .unwrap();
    let b = store
        .add_device(None, "press-1", Protocol::Opcua, serde_json::json!({}), None, true)
        .unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(b.protocol, Protocol::Modbus);
    assert_eq!(store.list_devices().len(), 1);
}

#[test]
fn bulk_create_normalizes_names_with_warnings() {
    let store = store();
    let schema = store.create_schema(None, "S", sample_fields()).unwrap();
    let (tables, warnings) = store
        .add_tables_bulk(
            &schema.id,
            &["Pump {1..3}".into(), "2ndFeeder".into()],
            None,
        )
        .unwrap();
    assert_eq!(tables.len(), 4);
    assert_eq!(tables[0].name, "Pump_1");
    assert_eq!(tables[3].name, "t_2ndFeeder");
    assert_eq!(warnings.len(), 4);
    assert_eq!(warnings[0].original, "Pump 1");
}

#[test]
fn copy_mapping_copies_rows_but_not_binding() {
    let store = store();
    let schema = store.create_schema(None, "S", sample_fields()).unwrap();
    let (tables, _) = store
        .add_tables_bulk(&schema.id, &["A".into(), "B".into()], None)
        .unwrap();
    let dev = store
        .add_device(None, "D", Protocol::Opcua, serde_json::json!({}), None, true)
        .unwrap();

    let mut rows = HashMap::new();
    rows.insert("r_current".to_string(), opcua_row("ns=2;s=C"));
    store
        .upsert_mapping(&tables[0].id, Some(dev.id.clone()), rows)
        .unwrap();

    let copied = store.copy_mapping(&tables[0].id, &tables[1].id).unwrap();
    assert_eq!(copied.rows.len(), 1);
    assert_eq!(copied.device_id, None);
    // source untouched
    assert_eq!(store.get_mapping(&tables[0].id).device_id, Some(dev.id));
}

#[test]
fn deleting_a_row_demotes_health() {
    let store = store();
    let schema = store.create_schema(None, "S", sample_fields()).unwrap();
    let (tables, _) = store
        .add_tables_bulk(&schema.id, &["A".into()], None)
        .unwrap();
    let table_id = &tables[0].id;

    let mut rows = HashMap::new();
    rows.insert("r_current".to_string(), opcua_row("ns=2;s=C"));
    rows.insert("voltage".to_string(), opcua_row("ns=2;s=V"));
    store.upsert_mapping(table_id, None, rows).unwrap();
    assert_eq!(store.mapping_health_of(table_id), MappingHealth::Mapped);

    store.delete_mapping_row(table_id, "voltage").unwrap();
    assert_eq!(store.mapping_health_of(table_id), MappingHealth::Partial);
    assert_eq!(
        store.get_table(table_id).unwrap().mapping_health,
        MappingHealth::Partial
    );

    store.delete_mapping_row(table_id, "r_current").unwrap();
    assert_eq!(store.mapping_health_of(table_id), MappingHealth::Unmapped);
}

#[test]
fn upsert_then_get_then_delete_row_law() {
    let store = store();
    let schema = store.create_schema(None, "S", sample_fields()).unwrap();
    let (tables, _) = store
        .add_tables_bulk(&schema.id, &["A".into()], None)
        .unwrap();
    let table_id = &tables[0].id;

    let mut rows = HashMap::new();
    rows.insert("r_current".to_string(), opcua_row("ns=2;s=C"));
    store.upsert_mapping(table_id, None, rows).unwrap();
    let mapping = store.get_mapping(table_id);
    assert_eq!(mapping.rows["r_current"].address, "ns=2;s=C");

    store.delete_mapping_row(table_id, "r_current").unwrap();
    assert!(!store.get_mapping(table_id).rows.contains_key("r_current"));
}

#[test]
fn job_preflight_rejects_unmapped_tables() {
    let store = store();
    let schema = store.create_schema(None, "S", sample_fields()).unwrap();
    let (tables, _) = store
        .add_tables_bulk(&schema.id, &["A".into()], None)
        .unwrap();

    let mut job = Job {
        id: String::new(),
        name: "J".into(),
        job_type: JobType::Continuous,
        tables: vec![],
        columns: ColumnsSelection::all(),
        interval_ms: 1000,
        enabled: false,
        status: JobStatus::Stopped,
        batching: Batching::default(),
        cpu_budget: CpuBudget::Balanced,
        triggers: vec![],
    };
    assert_eq!(
        store.create_job(job.clone()).unwrap_err().code(),
        "NO_TABLES"
    );

    job.tables = vec![tables[0].id.clone()];
    assert_eq!(
        store.create_job(job.clone()).unwrap_err().code(),
        "NO_MAPPED_COLUMNS"
    );

    let mut rows = HashMap::new();
    rows.insert("r_current".to_string(), opcua_row("ns=2;s=C"));
    store.upsert_mapping(&tables[0].id, None, rows).unwrap();
    let created = store.create_job(job).unwrap();
    assert!(created.id.starts_with("job_"));
}

#[test]
fn gateway_rules() {
    let store = store();
    assert_eq!(
        store
            .add_gateway(None, "gw", "10.0.0.1", None, None, &[0], None, vec![])
            .unwrap_err()
            .code(),
        "INVALID_PORTS"
    );
    let gw = store
        .add_gateway(None, "gw", "10.0.0.1", None, None, &[502, 4840], None, vec![])
        .unwrap();
    // add-or-reuse by host
    let again = store
        .add_gateway(None, "other", "10.0.0.1", None, None, &[], None, vec![])
        .unwrap();
    assert_eq!(gw.id, again.id);

    // rate limit: second test within 3s is refused
    store.rate_limit_gateway_test(&gw.id).unwrap();
    assert_eq!(
        store.rate_limit_gateway_test(&gw.id).unwrap_err().code(),
        "RATE_LIMITED"
    );

    // a device referencing the gateway blocks deletion
    store
        .add_device(
            None,
            "D",
            Protocol::Modbus,
            serde_json::json!({"gatewayId": gw.id}),
            None,
            true,
        )
        .unwrap();
    assert_matches!(
        store.delete_gateway(&gw.id),
        Err(AppError::GatewayInUse { .. })
    );
}

#[test]
fn gateway_health_derivation() {
    let store = store();
    let gw = store
        .add_gateway(None, "gw", "10.0.0.9", None, None, &[502], None, vec![])
        .unwrap();
    let updated = store
        .set_gateway_health(
            &gw.id,
            Some(serde_json::json!({"ok": false})),
            Some(serde_json::json!([{"port": 502, "status": "open"}])),
        )
        .unwrap();
    assert_eq!(updated.status, GatewayStatus::Limited);

    let updated = store
        .set_gateway_health(&gw.id, Some(serde_json::json!({"ok": false})), None)
        .unwrap();
    assert_eq!(updated.status, GatewayStatus::Unreachable);
}

#[test]
fn expand_pattern_shapes() {
    assert_eq!(expand_pattern("Plain"), vec!["Plain"]);
    assert_eq!(
        expand_pattern("Pump_{1..3}"),
        vec!["Pump_1", "Pump_2", "Pump_3"]
    );
    assert_eq!(expand_pattern("Bad_{3..1}"), vec!["Bad_{3..1}"]);
    assert_eq!(expand_pattern("T{1..2}_x"), vec!["T1_x", "T2_x"]);
}

#[test]
fn delete_job_reports_prior_existence() {
    let store = store();
    let schema = store.create_schema(None, "S", sample_fields()).unwrap();
    let (tables, _) = store
        .add_tables_bulk(&schema.id, &["A".into()], None)
        .unwrap();
    let mut rows = HashMap::new();
    rows.insert("r_current".to_string(), opcua_row("ns=2;s=C"));
    store.upsert_mapping(&tables[0].id, None, rows).unwrap();

    let job = store
        .create_job(Job {
            id: String::new(),
            name: "J".into(),
            job_type: JobType::Continuous,
            tables: vec![tables[0].id.clone()],
            columns: ColumnsSelection::all(),
            interval_ms: 1000,
            enabled: false,
            status: JobStatus::Stopped,
            batching: Batching::default(),
            cpu_budget: CpuBudget::Balanced,
            triggers: vec![],
        })
        .unwrap();
    assert!(store.delete_job(&job.id).unwrap());
    assert!(!store.delete_job(&job.id).unwrap());
}
