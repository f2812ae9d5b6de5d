#[cfg(test)]
mod tests {
    use anyhow::Result;
    use futures::TryStreamExt;
    use object_store::{ObjectMeta, ObjectStore};
    use reqwest::{
        multipart::{Form, Part},
        StatusCode,
    };
    use serde_json::Value;

    use crate::{config::UploadConfig, routes::UPLOAD_SIZE_HEADER, testing::TestService};

    async fn spawn_server(test_srv: &TestService) -> Result<String> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let routes = test_srv.service.routes();
        tokio::spawn(async move {
            let _ = axum::serve(listener, routes).await;
        });
        Ok(format!("http://{}", addr))
    }

    fn upload_form(contents: &'static [u8], filename: &str, email: Option<&str>) -> Form {
        let form = Form::new().part(
            "file",
            Part::bytes(contents).file_name(filename.to_string()),
        );
        match email {
            Some(email) => form.text("email", email.to_string()),
            None => form,
        }
    }

    async fn stored_objects(test_srv: &TestService) -> Result<Vec<ObjectMeta>> {
        let objects: Vec<ObjectMeta> = test_srv
            .service
            .blob_storage
            .get_object_store()
            .list(None)
            .try_collect()
            .await?;
        Ok(objects
            .into_iter()
            .filter(|meta| !meta.location.as_ref().starts_with("metadata"))
            .collect())
    }

    #[tokio::test]
    async fn test_file_lifecycle() -> Result<()> {
        let test_srv = TestService::new().await?;
        let base = spawn_server(&test_srv).await?;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("{base}/upload?session_id=abc"))
            .multipart(upload_form(b"hello world", "hello.txt", Some("a@example.com")))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await?;
        assert_eq!(body["session_id"], "abc");
        assert_eq!(body["message"], "File uploaded successfully");
        let key = body["s3_key"].as_str().unwrap().to_string();
        assert!(key.ends_with("_hello.txt"), "{key}");

        let res = client.get(format!("{base}/file/{key}")).send().await?;
        assert_eq!(res.status(), StatusCode::OK);
        let disposition = res.headers()["content-disposition"].to_str()?.to_string();
        assert_eq!(disposition, "attachment; filename=\"hello.txt\"");
        assert_eq!(res.bytes().await?.as_ref(), b"hello world");

        let metadata: Value = client
            .get(format!("{base}/file/{key}/metadata"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(metadata["email"], "a@example.com");
        assert_eq!(metadata["filename"], "hello.txt");

        let res = client
            .put(format!("{base}/update/{key}"))
            .multipart(upload_form(b"goodbye", "bye.txt", None))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await?;
        assert_eq!(body["updated_key"], key.as_str());

        let res = client.get(format!("{base}/file/{key}")).send().await?;
        assert_eq!(res.bytes().await?.as_ref(), b"goodbye");
        let metadata: Value = client
            .get(format!("{base}/file/{key}/metadata"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(metadata["filename"], "bye.txt");

        let res = client.delete(format!("{base}/delete/{key}")).send().await?;
        assert_eq!(res.status(), StatusCode::OK);
        let res = client.get(format!("{base}/file/{key}")).send().await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let res = client.delete(format!("{base}/delete/{key}")).send().await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let res = client
            .get(format!("{base}/file/{key}/metadata"))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_requires_file_and_email() -> Result<()> {
        let test_srv = TestService::new().await?;
        let base = spawn_server(&test_srv).await?;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("{base}/upload"))
            .multipart(upload_form(b"no owner", "orphan.txt", None))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.text().await?, "email is required");
        assert!(stored_objects(&test_srv).await?.is_empty());

        let res = client
            .post(format!("{base}/upload"))
            .multipart(Form::new().text("email", "a@example.com"))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.text().await?, "file is required");
        Ok(())
    }

    #[tokio::test]
    async fn test_email_before_file_is_accepted() -> Result<()> {
        let test_srv = TestService::new().await?;
        let base = spawn_server(&test_srv).await?;

        let form = Form::new()
            .text("email", "first@example.com")
            .part("file", Part::bytes(&b"data"[..]).file_name("late.bin"));
        let res = reqwest::Client::new()
            .post(format!("{base}/upload"))
            .multipart(form)
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await?;
        assert!(!body["session_id"].as_str().unwrap().is_empty());
        let key = body["s3_key"].as_str().unwrap();
        let record = test_srv.service.files.metadata(key).await?;
        assert_eq!(record.email, "first@example.com");
        Ok(())
    }

    #[tokio::test]
    async fn test_update_missing_file_is_not_found() -> Result<()> {
        let test_srv = TestService::new().await?;
        let base = spawn_server(&test_srv).await?;

        let res = reqwest::Client::new()
            .put(format!("{base}/update/missing_key"))
            .multipart(upload_form(b"contents", "x.txt", None))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(stored_objects(&test_srv).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_progress_stream_reports_each_part() -> Result<()> {
        let test_srv = TestService::with_upload_config(UploadConfig {
            chunk_size_bytes: 5,
            ..Default::default()
        })
        .await?;
        let base = spawn_server(&test_srv).await?;
        let client = reqwest::Client::new();

        let progress = client
            .get(format!("{base}/progress/s1"))
            .send()
            .await?;
        assert_eq!(progress.status(), StatusCode::OK);
        assert!(test_srv.service.progress.is_attached("s1"));

        let res = client
            .post(format!("{base}/upload?session_id=s1"))
            .header(UPLOAD_SIZE_HEADER, "20")
            .multipart(upload_form(
                b"abcdefghijklmnopqrst",
                "letters.txt",
                Some("a@example.com"),
            ))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        let (percents, last) = progress_percents(progress).await?;
        assert_eq!(percents, vec![25.0, 50.0, 75.0, 100.0]);
        assert_eq!(last, Some(serde_json::json!({"status": "complete"})));
        assert!(!test_srv.service.progress.is_attached("s1"));
        Ok(())
    }

    async fn progress_percents(progress: reqwest::Response) -> Result<(Vec<f64>, Option<Value>)> {
        let text = progress.text().await?;
        let events: Vec<Value> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()))
            .collect::<Result<_, _>>()?;
        let percents = events
            .iter()
            .filter_map(|event| event["percent"].as_f64())
            .collect();
        Ok((percents, events.last().cloned()))
    }

    #[tokio::test]
    async fn test_progress_without_size_header_reaches_full() -> Result<()> {
        let test_srv = TestService::with_upload_config(UploadConfig {
            chunk_size_bytes: 5,
            ..Default::default()
        })
        .await?;
        let base = spawn_server(&test_srv).await?;
        let client = reqwest::Client::new();

        let progress = client
            .get(format!("{base}/progress/s2"))
            .send()
            .await?;
        let res = client
            .post(format!("{base}/upload?session_id=s2"))
            .multipart(upload_form(
                b"abcdefghijklmnopqrst",
                "letters.txt",
                Some("a@example.com"),
            ))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::OK);

        let (percents, last) = progress_percents(progress).await?;
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(percents.last(), Some(&100.0));
        assert_eq!(last, Some(serde_json::json!({"status": "complete"})));
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_to_busy_session_is_conflict() -> Result<()> {
        let test_srv = TestService::new().await?;
        let base = spawn_server(&test_srv).await?;
        let _in_flight = test_srv.service.progress.claim("busy").unwrap();

        let res = reqwest::Client::new()
            .post(format!("{base}/upload?session_id=busy"))
            .multipart(upload_form(b"contents", "x.txt", Some("a@example.com")))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert!(stored_objects(&test_srv).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_index_and_docs() -> Result<()> {
        let test_srv = TestService::new().await?;
        let base = spawn_server(&test_srv).await?;
        let client = reqwest::Client::new();

        let res = client.get(format!("{base}/")).send().await?;
        assert_eq!(res.text().await?, "Upload server is running");

        let doc: Value = client
            .get(format!("{base}/docs/openapi.json"))
            .send()
            .await?
            .json()
            .await?;
        assert!(doc["paths"]["/upload"].is_object());
        assert!(doc["paths"]["/progress/{session_id}"].is_object());
        Ok(())
    }
}
