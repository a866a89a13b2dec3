use anyhow::Result;
use predicates::prelude::*;
use tempfile::tempdir;

mod common;
use common::*;

#[test]
fn missing_required_photos_path_is_a_nonzero_exit() -> Result<()> {
    cli()?.arg("analyze").assert().failure();
    Ok(())
}

#[test]
fn full_analyze_run_reports_duplicates_and_similars() -> Result<()> {
    let photos = tempdir()?;
    write_solid_png(&photos.path().join("a.png"), 10);
    write_solid_png(&photos.path().join("b.png"), 10);
    write_solid_png(&photos.path().join("unique.png"), 200);

    let query_dir = tempdir()?;
    let query_path = query_dir.path().join("query.png");
    write_solid_png(&query_path, 10);

    let cache = tempdir()?;
    let cache_file = cache.path().join("cache.bin");

    let output = cli()?
        .arg("analyze")
        .arg("--photos-path")
        .arg(photos.path())
        .arg("--cache-file")
        .arg(&cache_file)
        .arg("--analyze-duplicates")
        .arg("--check-similars")
        .arg(&query_path)
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone())?;
    let json: serde_json::Value = serde_json::from_str(&stdout)?;

    assert_eq!(json["duplicates"].as_array().unwrap().len(), 1);
    assert_eq!(json["duplicates"][0].as_array().unwrap().len(), 2);

    let query_key = query_path.to_string_lossy().to_string();
    let similars = json["similars"][&query_key].as_array().unwrap();
    assert!(!similars.is_empty());
    assert!(similars.iter().any(|entry| entry["similarity"] == 0));

    assert!(cache_file.exists());
    Ok(())
}

#[test]
fn cache_reuse_yields_identical_report_on_second_run() -> Result<()> {
    let photos = tempdir()?;
    write_solid_png(&photos.path().join("a.png"), 77);
    write_solid_png(&photos.path().join("b.png"), 200);

    let cache = tempdir()?;
    let cache_file = cache.path().join("cache.bin");

    let first = cli()?
        .arg("analyze")
        .arg("--photos-path")
        .arg(photos.path())
        .arg("--cache-file")
        .arg(&cache_file)
        .arg("--analyze-duplicates")
        .assert()
        .success();
    let second = cli()?
        .arg("analyze")
        .arg("--photos-path")
        .arg(photos.path())
        .arg("--cache-file")
        .arg(&cache_file)
        .arg("--analyze-duplicates")
        .assert()
        .success();

    assert_eq!(
        first.get_output().stdout,
        second.get_output().stdout,
    );
    Ok(())
}

#[test]
fn nonexistent_root_fails_with_diagnostic() -> Result<()> {
    let cache = tempdir()?;
    cli()?
        .arg("analyze")
        .arg("--photos-path")
        .arg("/does/not/exist/at/all")
        .arg("--cache-file")
        .arg(cache.path().join("cache.bin"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a directory"));
    Ok(())
}

#[test]
fn report_can_be_written_to_a_file() -> Result<()> {
    let photos = tempdir()?;
    write_solid_png(&photos.path().join("a.png"), 5);

    let cache = tempdir()?;
    let out_dir = tempdir()?;
    let out_file = out_dir.path().join("report.json");

    cli()?
        .arg("analyze")
        .arg("--photos-path")
        .arg(photos.path())
        .arg("--cache-file")
        .arg(cache.path().join("cache.bin"))
        .arg("--output")
        .arg(&out_file)
        .assert()
        .success();

    let contents = std::fs::read_to_string(&out_file)?;
    let _: serde_json::Value = serde_json::from_str(&contents)?;
    Ok(())
}
