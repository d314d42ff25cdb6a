use super::*;
use std::io::Read;

fn read_entries(container: &std::path::Path) -> Vec<(String, String)> {
    let file = std::fs::File::open(container).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        entries.push((entry.name().to_string(), body));
    }
    entries.sort();
    entries
}

#[tokio::test]
async fn test_concurrent_tasks_share_one_container() {
    let (downloader, transport, _temp_dir) = create_test_downloader(0).await;
    let container = dest(&downloader, "bundle.zip");

    transport.route_fn(BASE, |req| {
        let name = req.url.rsplit('/').next().unwrap_or_default().to_string();
        FakeResponse::ok(format!("body of {}", name)).chunked(2)
    });

    let ids: Vec<TaskId> = (0..8)
        .map(|i| {
            let name = format!("item{}.txt", i);
            downloader
                .submit(DownloadRequest::new(url(&name), container.join(&name)))
                .unwrap()
        })
        .collect();
    wait_until_idle(&downloader).await;

    for id in &ids {
        assert_eq!(downloader.task(*id).unwrap().state, TaskState::Completed);
    }
    assert!(downloader.close_archive(&container).await.unwrap());

    let entries = read_entries(&container);
    assert_eq!(entries.len(), 8);
    for (i, (name, body)) in entries.iter().enumerate() {
        assert_eq!(name, &format!("item{}.txt", i));
        assert_eq!(body, &format!("body of item{}.txt", i));
    }
}

#[tokio::test]
async fn test_nested_entry_path_inside_container() {
    let (downloader, transport, _temp_dir) = create_test_downloader(2).await;
    let container = dest(&downloader, "posts.zip");

    transport.route(url("p1.jpg"), FakeResponse::ok("jpeg"));
    let id = downloader
        .submit(DownloadRequest::new(url("p1.jpg"), container.join("post-1/p1.jpg")))
        .unwrap();
    wait_for_state(&downloader, id, TaskState::Completed).await;
    assert_eq!(
        downloader.task(id).unwrap().destination,
        container.join("post-1/p1.jpg")
    );

    downloader.close_archive(&container).await.unwrap();
    assert_eq!(
        read_entries(&container),
        vec![("post-1/p1.jpg".to_string(), "jpeg".to_string())]
    );
}

#[tokio::test]
async fn test_sink_failure_fails_every_bound_task() {
    let (downloader, transport, _temp_dir) = create_test_downloader(0).await;
    let mut rx = downloader.subscribe();

    // container's parent is a regular file, so the sink cannot open
    let blocker = dest(&downloader, "blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let container = blocker.join("out.zip");

    let gate = Arc::new(Notify::new());
    transport.route(url("b"), FakeResponse::ok("b").gated(gate.clone()));
    transport.route(url("c"), FakeResponse::ok("c").gated(gate.clone()));
    transport.route(url("a"), FakeResponse::ok("a"));

    let b = downloader
        .submit(DownloadRequest::new(url("b"), container.join("b")))
        .unwrap();
    let c = downloader
        .submit(DownloadRequest::new(url("c"), container.join("c")))
        .unwrap();
    let a = downloader
        .submit(DownloadRequest::new(url("a"), container.join("a")))
        .unwrap();

    let events = collect_events(&mut rx, |events| {
        events.iter().any(|e| matches!(e, Event::SinkFailed { .. }))
            && reached(events, TaskState::Failed).len() == 3
    })
    .await;

    let failed = reached(&events, TaskState::Failed);
    for id in [a, b, c] {
        assert!(failed.contains(&id));
        let info = downloader.task(id).unwrap();
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.error.unwrap().class, ErrorClass::Sink);
    }

    // the failed sink refuses work until it is reopened
    let err = downloader
        .submit(DownloadRequest::new(url("a"), container.join("again")))
        .unwrap_err();
    assert!(matches!(err, Error::Sink { .. }));

    std::fs::remove_file(&blocker).unwrap();
    assert!(downloader.reopen_archive(&container));
    let again = downloader
        .submit(DownloadRequest::new(url("a"), container.join("again")))
        .unwrap();
    wait_for_state(&downloader, again, TaskState::Completed).await;

    downloader.close_archive(&container).await.unwrap();
    assert_eq!(
        read_entries(&container),
        vec![("again".to_string(), "a".to_string())]
    );
}

#[tokio::test]
async fn test_close_archive_fails_unfinished_tasks() {
    let (downloader, transport, _temp_dir) = create_test_downloader(2).await;
    let container = dest(&downloader, "closing.zip");
    let gate = Arc::new(Notify::new());

    transport.route(url("stuck"), FakeResponse::ok("stuck").gated(gate));
    let id = downloader
        .submit(DownloadRequest::new(url("stuck"), container.join("stuck")))
        .unwrap();

    downloader.close_archive(&container).await.unwrap();
    wait_for_state(&downloader, id, TaskState::Failed).await;

    let error = downloader.task(id).unwrap().error.unwrap();
    assert_eq!(error.class, ErrorClass::Sink);
    assert_eq!(error.detail, "sink closed");
}

#[tokio::test]
async fn test_submit_after_close_appends() {
    let (downloader, transport, _temp_dir) = create_test_downloader(2).await;
    let container = dest(&downloader, "growing.zip");

    transport.route(BASE, FakeResponse::ok("data"));
    let first = downloader
        .submit(DownloadRequest::new(url("first"), container.join("first")))
        .unwrap();
    wait_for_state(&downloader, first, TaskState::Completed).await;
    downloader.close_archive(&container).await.unwrap();

    let second = downloader
        .submit(DownloadRequest::new(url("second"), container.join("second")))
        .unwrap();
    wait_for_state(&downloader, second, TaskState::Completed).await;
    downloader.close_archive(&container).await.unwrap();

    let names: Vec<String> = read_entries(&container)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["first", "second"]);
}
