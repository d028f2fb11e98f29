use anyhow::Context;
use async_recursion::async_recursion;

pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("uio_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    let tmp_dir = create_temp_dir().await?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    let foo_path = tmp_dir.join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    Ok(tmp_dir)
}

#[async_recursion]
pub async fn check_dirs_identical(src: &std::path::Path, dst: &std::path::Path) -> anyhow::Result<()> {
    let mut src_count = 0;
    let mut src_entries = tokio::fs::read_dir(src).await?;
    while let Some(src_entry) = src_entries.next_entry().await? {
        src_count += 1;
        let src_entry_path = src_entry.path();
        let dst_entry_path = dst.join(src_entry.file_name());
        let src_md = tokio::fs::metadata(&src_entry_path)
            .await
            .with_context(|| format!("Source file {:?} is missing!", &src_entry_path))?;
        let dst_md = tokio::fs::metadata(&dst_entry_path)
            .await
            .with_context(|| format!("Destination file {:?} is missing!", &dst_entry_path))?;
        assert_eq!(src_md.is_file(), dst_md.is_file(), "{src_entry_path:?}");
        if src_md.is_file() {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert_eq!(src_contents, dst_contents, "{src_entry_path:?}");
        } else {
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        }
    }
    let mut dst_count = 0;
    let mut dst_entries = tokio::fs::read_dir(dst).await?;
    while dst_entries.next_entry().await?.is_some() {
        dst_count += 1;
    }
    assert_eq!(src_count, dst_count, "{dst:?} has extra entries");
    Ok(())
}
