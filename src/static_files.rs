use std::path::{Component, Path, PathBuf};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// C9 static branch — resolves a request path against `root`, rejecting any traversal outside
/// it, and unconditionally falls back to `root`'s `index.html` when the resolved path is missing,
/// per §4.9 step 3 ("if still missing, fall back to `<staticDir>/index.html`").
pub async fn serve(root: &Path, request_path: &str) -> Response<Full<Bytes>> {
  let Some(relative) = sanitize_path(request_path) else {
    return not_found();
  };

  let candidate = root.join(&relative);
  match read_file_or_dir_index(&candidate).await {
    Ok(Some((path, contents))) => return file_response(&path, contents),
    Ok(None) => {}
    Err(()) => return internal_error(),
  }

  let index = root.join("index.html");
  match tokio::fs::read(&index).await {
    Ok(contents) => file_response(&index, contents),
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => not_found(),
    Err(_) => internal_error(),
  }
}

/// Reads `candidate` as a file, or as a directory's `index.html` if `candidate` is a directory.
/// `Ok(None)` means "not found, fall through to the SPA/404 chain"; `Err(())` means a real I/O
/// error (permissions, etc.) that must surface as a 500, per §7's "404 for missing, 500 for I/O".
async fn read_file_or_dir_index(candidate: &Path) -> Result<Option<(PathBuf, Vec<u8>)>, ()> {
  match tokio::fs::metadata(candidate).await {
    Ok(meta) if meta.is_dir() => {
      let index = candidate.join("index.html");
      match tokio::fs::read(&index).await {
        Ok(contents) => Ok(Some((index, contents))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(_) => Err(()),
      }
    }
    Ok(_) => match tokio::fs::read(candidate).await {
      Ok(contents) => Ok(Some((candidate.to_path_buf(), contents))),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(_) => Err(()),
    },
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(_) => Err(()),
  }
}

/// Rejects absolute paths, `..` components, and anything else that could escape `root` once
/// joined. Returns the cleaned relative path on success.
fn sanitize_path(request_path: &str) -> Option<PathBuf> {
  let trimmed = request_path.trim_start_matches('/');
  let decoded = urlencoding::decode(trimmed).ok()?;
  let mut cleaned = PathBuf::new();
  for component in Path::new(decoded.as_ref()).components() {
    match component {
      Component::Normal(part) => cleaned.push(part),
      Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
    }
  }
  Some(cleaned)
}

fn file_response(path: &Path, contents: Vec<u8>) -> Response<Full<Bytes>> {
  let mime = new_mime_guess::from_path(path).first_or_octet_stream();
  Response::builder()
    .status(StatusCode::OK)
    .header(hyper::header::CONTENT_TYPE, mime.as_ref())
    .header(hyper::header::CACHE_CONTROL, "no-cache")
    .body(Full::new(Bytes::from(contents)))
    .unwrap()
}

fn not_found() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::NOT_FOUND)
    .body(Full::new(Bytes::from_static(b"not found")))
    .unwrap()
}

fn internal_error() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::INTERNAL_SERVER_ERROR)
    .body(Full::new(Bytes::from_static(b"internal server error")))
    .unwrap()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sanitize_path_rejects_traversal() {
    assert!(sanitize_path("/../../etc/passwd").is_none());
    assert!(sanitize_path("/assets/../../etc/passwd").is_none());
  }

  #[test]
  fn sanitize_path_keeps_normal_paths() {
    assert_eq!(sanitize_path("/assets/app.js"), Some(PathBuf::from("assets/app.js")));
    assert_eq!(sanitize_path("/"), Some(PathBuf::new()));
  }

  #[tokio::test]
  async fn missing_extensionless_path_falls_back_to_index() {
    let dir = std::env::temp_dir().join(format!("hostgate-static-test-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("index.html"), "<html>shell</html>").await.unwrap();

    let response = serve(&dir, "/dashboard/settings").await;
    assert_eq!(response.status(), StatusCode::OK);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }

  #[tokio::test]
  async fn missing_path_with_extension_also_falls_back_to_index() {
    let dir = std::env::temp_dir().join(format!("hostgate-static-test-ext-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("index.html"), "<html>shell</html>").await.unwrap();

    let response = serve(&dir, "/assets/app.abc123.js").await;
    assert_eq!(response.status(), StatusCode::OK);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn unreadable_file_returns_internal_error() {
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!("hostgate-static-test-perm-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let file = dir.join("secret.txt");
    tokio::fs::write(&file, "top secret").await.unwrap();
    tokio::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o000)).await.unwrap();

    let response = serve(&dir, "/secret.txt").await;

    tokio::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).await.unwrap();
    tokio::fs::remove_dir_all(&dir).await.unwrap();

    // Skipped under a root-run test harness, where file permissions are never enforced.
    if unsafe { libc::geteuid() } != 0 {
      assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
  }
}
