mod test_support;

use gradebookd::{archive, db};
use serde_json::json;
use test_support::{
    as_actor, class_head, compile, demo, next_id, open_demo_workspace, publish_semester,
    request_err, request_ok, seed_semester_marks, spawn_sidecar, temp_dir,
};

fn as_store_house(params: serde_json::Value) -> serde_json::Value {
    as_actor("store_house", demo::STORE_HOUSE, params)
}

#[test]
fn roster_requires_fully_published_semester() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_demo_workspace(&mut stdin, &mut reader, "gradebook-roster-gate");
    let send = class_head(json!({ "semester_id": demo::SEM1 }));

    let code = request_err(&mut stdin, &mut reader, &next_id(), "roster.send", send.clone());
    assert_eq!(code, "NOT_FOUND");

    seed_semester_marks(&mut stdin, &mut reader, demo::SEM1);
    compile(&mut stdin, &mut reader, demo::SEM1);
    let code = request_err(&mut stdin, &mut reader, &next_id(), "roster.send", send.clone());
    assert_eq!(code, "NOT_FOUND");

    let code = request_err(
        &mut stdin,
        &mut reader,
        &next_id(),
        "roster.send",
        as_actor(
            "teacher",
            demo::TEACHER_ALMAZ,
            json!({ "semester_id": demo::SEM1 }),
        ),
    );
    assert_eq!(code, "FORBIDDEN");
}

#[test]
fn roster_send_is_idempotent_and_readable_by_store_house() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_demo_workspace(&mut stdin, &mut reader, "gradebook-roster-send");
    seed_semester_marks(&mut stdin, &mut reader, demo::SEM1);
    compile(&mut stdin, &mut reader, demo::SEM1);
    publish_semester(&mut stdin, &mut reader, demo::SEM1);

    let send = class_head(json!({ "semester_id": demo::SEM1 }));
    let first = request_ok(&mut stdin, &mut reader, &next_id(), "roster.send", send.clone());
    assert_eq!(first["kind"], "semester");
    assert_eq!(first["class_name"], "9A");
    assert_eq!(first["students_count"], 3);
    assert_eq!(first["unchanged"], false);
    assert_eq!(
        first["payload_sha256"].as_str().expect("digest").len(),
        64
    );

    let second = request_ok(&mut stdin, &mut reader, &next_id(), "roster.send", send);
    assert_eq!(second["unchanged"], true);
    assert_eq!(second["roster_id"], first["roster_id"]);
    assert_eq!(second["sent_at"], first["sent_at"]);
    assert_eq!(second["payload_sha256"], first["payload_sha256"]);

    let list = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "rosters.list",
        as_store_house(json!({ "academic_year_id": demo::YEAR })),
    );
    let items = list["items"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["roster_id"], first["roster_id"]);
    assert_eq!(items[0]["grade_name"], "Grade 9");
    assert_eq!(items[0]["semester_id"], demo::SEM1);
    assert_eq!(items[0]["students_count"], 3);

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "rosters.list",
        as_store_house(json!({ "academic_year_id": demo::OLD_YEAR })),
    );
    assert!(empty["items"].as_array().expect("items").is_empty());

    let roster_id = first["roster_id"].as_str().expect("roster_id");
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "rosters.get",
        as_store_house(json!({ "roster_id": roster_id })),
    );
    let payload = &detail["payload"];
    assert_eq!(payload["kind"], "semester");
    assert_eq!(payload["class"]["name"], "9A");
    assert_eq!(payload["class_head"]["name"], "Class Head Yohannes Bekele");
    assert_eq!(payload["semester"]["name"], "First Semester");
    assert_eq!(payload["statistics"]["total_students"], 3);
    assert_eq!(payload["statistics"]["promoted"], 2);
    assert_eq!(payload["statistics"]["retained"], 1);
    let students = payload["students"].as_array().expect("students");
    assert_eq!(students.len(), 3);
    assert_eq!(students[0]["student_code"], "AASS-2024-001");
    assert!(students[0]["age"].is_i64());
    assert_eq!(students[0]["subjects"].as_array().expect("subjects").len(), 4);

    let code = request_err(
        &mut stdin,
        &mut reader,
        &next_id(),
        "rosters.get",
        as_store_house(json!({ "roster_id": "missing" })),
    );
    assert_eq!(code, "NOT_FOUND");

    let code = request_err(
        &mut stdin,
        &mut reader,
        &next_id(),
        "rosters.list",
        as_actor("student", demo::STUDENT_USER_ABEBE, json!({})),
    );
    assert_eq!(code, "FORBIDDEN");
}

#[test]
fn roster_archive_round_trips_digests() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_demo_workspace(&mut stdin, &mut reader, "gradebook-roster-archive");
    seed_semester_marks(&mut stdin, &mut reader, demo::SEM1);
    compile(&mut stdin, &mut reader, demo::SEM1);
    publish_semester(&mut stdin, &mut reader, demo::SEM1);
    request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "roster.send",
        class_head(json!({ "semester_id": demo::SEM1 })),
    );

    let export = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "rosters.exportArchive",
        as_store_house(json!({ "file_name": "rosters-2024.zip" })),
    );
    let out = workspace.join(archive::EXPORT_DIR).join("rosters-2024.zip");
    assert_eq!(export["ok"], true);
    assert_eq!(export["path"], &*out.to_string_lossy());
    assert_eq!(export["archiveFormat"], archive::ARCHIVE_FORMAT_V1);
    assert_eq!(export["rosterCount"], 1);
    assert_eq!(export["entryCount"], 2);

    let verified = archive::verify_archive(&out).expect("verify archive");
    assert_eq!(verified, 1);
}

#[test]
fn roster_archive_cannot_escape_the_exports_directory() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_demo_workspace(&mut stdin, &mut reader, "gradebook-roster-confined");
    let db_path = workspace.join(db::DB_FILE_NAME);
    let db_before = std::fs::read(&db_path).expect("read db");

    let outside = temp_dir("gradebook-roster-outside").join("rosters.zip");
    for params in [
        json!({ "file_name": db_path.to_string_lossy() }),
        json!({ "file_name": outside.to_string_lossy() }),
        json!({ "file_name": "../gradebook.sqlite3" }),
        json!({ "file_name": "../escaped.zip" }),
        json!({ "file_name": "gradebook.sqlite3" }),
        json!({ "out_path": db_path.to_string_lossy() }),
    ] {
        let code = request_err(
            &mut stdin,
            &mut reader,
            &next_id(),
            "rosters.exportArchive",
            as_store_house(params.clone()),
        );
        assert_eq!(code, "VALIDATION_ERROR", "{params}");
    }

    assert!(!outside.exists());
    assert!(!workspace.join("escaped.zip").exists());
    assert_eq!(std::fs::read(&db_path).expect("read db"), db_before);

    // The workspace still answers reads afterwards.
    let list = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "rosters.list",
        as_store_house(json!({})),
    );
    assert!(list["items"].as_array().expect("items").is_empty());
}
