use omnidex::catalog::MediaKind;
use omnidex::error::{OmnidexError, OmnidexResult};
use omnidex::media::{Descriptors, ExtractorId, FeatureExtractor};
use omnidex::Engine;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

fn new_engine(dir: &TempDir) -> Engine {
    Engine::open(dir.path().join("data")).unwrap()
}

#[test]
fn btree_range_returns_rows_in_ascending_key_order() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let csv = write_csv(
        dir.path(),
        "s.csv",
        "name,math_score\nana,95\nbeto,80\ncarla,75\ndiego,90\nelena,85\nfede,82\n",
    );
    engine
        .execute(&format!(
            r#"CREATE TABLE students FROM FILE "{}" USING INDEX btree(math_score)"#,
            csv.display()
        ))
        .unwrap();

    let out = engine
        .execute("SELECT * FROM students WHERE math_score BETWEEN 80 AND 90 LIMIT 100")
        .unwrap();
    let scores: Vec<&str> = out.rows.iter().map(|r| r[1].as_str()).collect();
    assert_eq!(scores, vec!["80", "82", "85", "90"]);
    let names: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(names, vec!["beto", "fede", "elena", "diego"]);
}

#[test]
fn hash_point_lookup_over_ten_thousand_ids() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let mut content = String::from("order_id,amount\n");
    for i in 0..10_000 {
        content.push_str(&format!("ord{:05},{}\n", i, i % 97));
    }
    let csv = write_csv(dir.path(), "orders.csv", &content);
    engine
        .execute(&format!(
            r#"CREATE TABLE orders FROM FILE "{}" USING INDEX hash(order_id)"#,
            csv.display()
        ))
        .unwrap();

    for probe in [0, 1, 4_242, 9_999] {
        let out = engine
            .execute(&format!(
                r#"SELECT * FROM orders WHERE order_id = "ord{:05}""#,
                probe
            ))
            .unwrap();
        assert_eq!(out.count, 1, "ord{:05}", probe);
        assert_eq!(out.rows[0][0], format!("ord{:05}", probe));
    }
    let out = engine
        .execute(r#"SELECT * FROM orders WHERE order_id = "ord99999""#)
        .unwrap();
    assert_eq!(out.count, 0);

    // The hash binding enforces uniqueness.
    let err = engine
        .execute(r#"INSERT INTO orders VALUES ("ord00000", "7")"#)
        .unwrap_err();
    assert_eq!(err.kind(), "DuplicateKey");
}

#[test]
fn rtree_radius_search_in_haversine_kilometers() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let csv = write_csv(
        dir.path(),
        "places.csv",
        "name,lat,lon\npike,47.60,-122.33\ncapitol,47.62,-122.30\nfar,48.00,-121.00\n",
    );
    engine
        .execute(&format!(
            r#"CREATE TABLE places FROM FILE "{}" USING INDEX rtree(lat, lon)"#,
            csv.display()
        ))
        .unwrap();

    let out = engine
        .execute(r#"SELECT * FROM places WHERE lat IN ("47.61,-122.31", 5.0)"#)
        .unwrap();
    assert_eq!(out.columns.last().map(String::as_str), Some("distance"));
    let names: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(names, vec!["capitol", "pike"]);
    let distances: Vec<f64> = out
        .rows
        .iter()
        .map(|r| r.last().unwrap().parse().unwrap())
        .collect();
    assert!(distances[0] < distances[1]);
    assert!(distances.iter().all(|d| *d <= 5.0));

    let knn = engine
        .execute(r#"SELECT name FROM places WHERE lat IN ("47.61,-122.31", 3)"#)
        .unwrap();
    let names: Vec<&str> = knn.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(names, vec!["capitol", "pike", "far"]);
}

#[test]
fn geo2d_field_is_geographic_regardless_of_its_name() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    // The coordinate column is geo2d-typed but not named like one.
    let csv = write_csv(
        dir.path(),
        "stops.csv",
        "name,position\npike,\"47.60,-122.33\"\ncapitol,\"47.62,-122.30\"\nfar,\"48.00,-121.00\"\n",
    );
    engine
        .execute(&format!(
            r#"CREATE TABLE stops FROM FILE "{}" USING INDEX rtree(position)"#,
            csv.display()
        ))
        .unwrap();

    // A 5 km Haversine radius keeps the two downtown stops; under a
    // Euclidean reading of degrees everything would be within 5.0.
    let out = engine
        .execute(r#"SELECT name FROM stops WHERE position IN ("47.61,-122.31", 5.0)"#)
        .unwrap();
    let names: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(names, vec!["capitol", "pike"]);
    let distances: Vec<f64> = out
        .rows
        .iter()
        .map(|r| r.last().unwrap().parse().unwrap())
        .collect();
    // Kilometer-scale values, not degree-scale: the metric is Haversine.
    assert!(distances[1] > 1.0 && distances[1] <= 5.0);
}

#[test]
fn spimi_ranks_by_tfidf_cosine() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let csv = write_csv(
        dir.path(),
        "songs.csv",
        "title,lyrics\nd1,love and light\nd2,light and shadow\n",
    );
    engine
        .execute(&format!(
            r#"CREATE TABLE songs FROM FILE "{}" USING INDEX spimi(lyrics)"#,
            csv.display()
        ))
        .unwrap();

    let out = engine
        .execute(r#"SELECT title FROM songs WHERE lyrics @@ "light love""#)
        .unwrap();
    let titles: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(titles, vec!["d1", "d2"]);

    let out = engine
        .execute(r#"SELECT title FROM songs WHERE lyrics @@ "shadow""#)
        .unwrap();
    let titles: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(titles, vec!["d2"]);

    // Inserts are visible through the delta index without a rebuild.
    engine
        .execute(r#"INSERT INTO songs VALUES ("d3", "shadow dance")"#)
        .unwrap();
    let out = engine
        .execute(r#"SELECT title FROM songs WHERE lyrics @@ "dance""#)
        .unwrap();
    assert_eq!(out.rows[0][0], "d3");
}

/// Deterministic stand-in for the external descriptor suppliers: maps an
/// asset path stem to a fixed global vector.
#[derive(Debug)]
struct StubExtractor;

impl FeatureExtractor for StubExtractor {
    fn id(&self) -> ExtractorId {
        ExtractorId::new("stub", "1.0")
    }

    fn extract(&self, asset_path: &Path) -> OmnidexResult<Descriptors> {
        let stem = asset_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let s = std::f32::consts::FRAC_1_SQRT_2;
        let vector = match stem {
            "h1" => vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            "h2" => vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            "h3" => vec![s, s, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            other => {
                return Err(OmnidexError::NotFound(format!(
                    "no stub vector for \"{}\"",
                    other
                )))
            }
        };
        Ok(Descriptors::Global(vector))
    }
}

#[test]
fn multimedia_inverted_and_sequential_agree() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    engine.register_extractor(MediaKind::Image, "stub", Arc::new(StubExtractor));
    let csv = write_csv(
        dir.path(),
        "covers.csv",
        "album,path\none,h1.png\ntwo,h2.png\nthree,h3.png\n",
    );
    engine
        .execute(&format!(
            r#"CREATE MULTIMEDIA TABLE covers FROM FILE "{}" USING image WITH METHOD stub CLUSTERS 8"#,
            csv.display()
        ))
        .unwrap();

    let sequential = engine
        .execute(r#"SELECT album FROM covers WHERE path <-> "h1.png" METHOD sequential LIMIT 3"#)
        .unwrap();
    let inverted = engine
        .execute(r#"SELECT album FROM covers WHERE path <-> "h1.png" METHOD inverted LIMIT 3"#)
        .unwrap();

    let seq_albums: Vec<&str> = sequential.rows.iter().map(|r| r[0].as_str()).collect();
    let inv_albums: Vec<&str> = inverted.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(seq_albums, vec!["one", "three", "two"]);
    assert_eq!(seq_albums, inv_albums);
    assert_eq!(sequential.columns.last().map(String::as_str), Some("similarity"));
}

#[test]
fn predicate_index_mismatch_fails_fast() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let csv = write_csv(dir.path(), "t.csv", "id,name\n1,ana\n2,beto\n");
    engine
        .execute(&format!(
            r#"CREATE TABLE t FROM FILE "{}" USING INDEX hash(id)"#,
            csv.display()
        ))
        .unwrap();

    let err = engine
        .execute("SELECT * FROM t WHERE id BETWEEN 1 AND 2")
        .unwrap_err();
    assert_eq!(err.kind(), "UnsupportedPredicate");

    let err = engine
        .execute(r#"SELECT * FROM t WHERE id @@ "ana""#)
        .unwrap_err();
    assert_eq!(err.kind(), "UnsupportedPredicate");

    let err = engine.execute("SELECT * FROM missing").unwrap_err();
    assert_eq!(err.kind(), "UnknownTable");

    let err = engine
        .execute(r#"SELECT * FROM t WHERE ghost = "x""#)
        .unwrap_err();
    assert_eq!(err.kind(), "UnknownField");

    let err = engine.execute("SELECTX").unwrap_err();
    assert_eq!(err.kind(), "ParseError");
}

#[test]
fn non_indexed_predicates_fall_back_to_full_scan() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let csv = write_csv(
        dir.path(),
        "t.csv",
        "id,name,score\n1,ana,10\n2,beto,20\n3,ana,30\n",
    );
    engine
        .execute(&format!(
            r#"CREATE TABLE t FROM FILE "{}" USING INDEX btree(id)"#,
            csv.display()
        ))
        .unwrap();

    let out = engine
        .execute(r#"SELECT id FROM t WHERE name = "ana""#)
        .unwrap();
    let ids: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(ids, vec!["1", "3"]);

    let out = engine
        .execute("SELECT id FROM t WHERE score BETWEEN 15 AND 35")
        .unwrap();
    let ids: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(ids, vec!["2", "3"]);
}

#[test]
fn insert_delete_and_drop_lifecycle() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let csv = write_csv(dir.path(), "t.csv", "id,name\n1,ana\n2,beto\n");
    engine
        .execute(&format!(
            r#"CREATE TABLE t FROM FILE "{}" USING INDEX btree(id)"#,
            csv.display()
        ))
        .unwrap();

    engine
        .execute(r#"INSERT INTO t VALUES (3, "carla")"#)
        .unwrap();
    let out = engine.execute("SELECT * FROM t WHERE id = 3").unwrap();
    assert_eq!(out.rows[0][1], "carla");

    let out = engine.execute("DELETE FROM t WHERE id = 2").unwrap();
    assert_eq!(out.count, 1);
    assert_eq!(engine.execute("SELECT * FROM t WHERE id = 2").unwrap().count, 0);
    // Deleting an absent key is a no-op, not an error.
    assert_eq!(engine.execute("DELETE FROM t WHERE id = 2").unwrap().count, 0);

    // Delete by a non-indexed field unlinks only the matching rows.
    engine
        .execute(r#"INSERT INTO t VALUES (4, "ana")"#)
        .unwrap();
    let out = engine.execute(r#"DELETE FROM t WHERE name = "ana""#).unwrap();
    assert_eq!(out.count, 2);
    assert_eq!(engine.execute("SELECT * FROM t WHERE id = 3").unwrap().count, 1);

    engine.execute("DROP TABLE t").unwrap();
    let err = engine.execute("SELECT * FROM t").unwrap_err();
    assert_eq!(err.kind(), "UnknownTable");
}

#[test]
fn generate_data_bulk_loads_synthetic_rows() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let csv = write_csv(dir.path(), "t.csv", "id,name\n0,seed\n");
    engine
        .execute(&format!(
            r#"CREATE TABLE t FROM FILE "{}" USING INDEX btree(id)"#,
            csv.display()
        ))
        .unwrap();
    let out = engine.execute("INSERT INTO t GENERATE_DATA(50)").unwrap();
    assert_eq!(out.count, 50);
    let out = engine
        .execute("SELECT * FROM t WHERE id BETWEEN 0 AND 1000 LIMIT 100")
        .unwrap();
    assert_eq!(out.count, 51);
}

#[test]
fn tables_reopen_from_their_artifacts() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let csv = write_csv(dir.path(), "t.csv", "id,name\n1,ana\n2,beto\n3,carla\n");
    {
        let engine = Engine::open(&data_dir).unwrap();
        engine
            .execute(&format!(
                r#"CREATE TABLE t FROM FILE "{}" USING INDEX sequential(id)"#,
                csv.display()
            ))
            .unwrap();
        engine.execute("DELETE FROM t WHERE id = 2").unwrap();
    }
    let engine = Engine::open(&data_dir).unwrap();
    let out = engine
        .execute("SELECT name FROM t WHERE id BETWEEN 1 AND 3")
        .unwrap();
    let names: Vec<&str> = out.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(names, vec!["ana", "carla"]);
}

#[test]
fn limit_defaults_to_ten() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let mut content = String::from("id,v\n");
    for i in 0..25 {
        content.push_str(&format!("{},{}\n", i, i));
    }
    let csv = write_csv(dir.path(), "t.csv", &content);
    engine
        .execute(&format!(
            r#"CREATE TABLE t FROM FILE "{}" USING INDEX btree(id)"#,
            csv.display()
        ))
        .unwrap();
    assert_eq!(engine.execute("SELECT * FROM t").unwrap().count, 10);
    assert_eq!(
        engine.execute("SELECT * FROM t LIMIT 25").unwrap().count,
        25
    );
}
