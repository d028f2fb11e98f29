//! Lazy tree traversal pairing every resource with its mirrored target.

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::descriptor::Descriptor;
use crate::error::Result;

struct Walk {
    // directories still to be listed, paired with their mirror
    stack: Vec<(Descriptor, Descriptor)>,
    current: Option<(BoxStream<'static, Result<Descriptor>>, Descriptor)>,
    include_directories: bool,
    recursive: bool,
    done: bool,
}

impl Walk {
    async fn next_pair(&mut self) -> Option<Result<(Descriptor, Descriptor)>> {
        loop {
            if self.done {
                return None;
            }
            if let Some((children, mirror)) = self.current.as_mut() {
                match children.next().await {
                    Some(Ok(child)) => {
                        let Some(name) = child.basename() else {
                            continue;
                        };
                        let mirrored = mirror.child(&name);
                        match child.is_dir().await {
                            Ok(true) => {
                                if self.recursive {
                                    self.stack.push((child.clone(), mirrored.clone()));
                                }
                                if self.include_directories {
                                    return Some(Ok((child, mirrored)));
                                }
                            }
                            Ok(false) => return Some(Ok((child, mirrored))),
                            Err(error) => {
                                self.done = true;
                                return Some(Err(error));
                            }
                        }
                    }
                    Some(Err(error)) => {
                        self.done = true;
                        return Some(Err(error));
                    }
                    None => self.current = None,
                }
                continue;
            }
            let (dir, mirror) = self.stack.pop()?;
            tracing::trace!("crawling {}", &dir);
            match dir.list().await {
                Ok(children) => self.current = Some((children, mirror)),
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

/// Walks everything below `root`, yielding `(resource, mirror)` pairs where `mirror` is the
/// same relative path below `mirror_root`.
///
/// The root itself is not yielded. A directory is always yielded before any of its
/// descendants. The stream ends after the first error.
pub fn crawl(
    root: &Descriptor,
    mirror_root: &Descriptor,
    include_directories: bool,
    recursive: bool,
) -> BoxStream<'static, Result<(Descriptor, Descriptor)>> {
    let walk = Walk {
        stack: vec![(root.clone(), mirror_root.clone())],
        current: None,
        include_directories,
        recursive,
        done: false,
    };
    futures::stream::unfold(walk, |mut walk| async move {
        walk.next_pair().await.map(|pair| (pair, walk))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::LocalBackend;
    use crate::context::Context;
    use crate::error::Error;
    use crate::testutils;
    use tracing_test::traced_test;

    async fn relative_paths(
        root: &Descriptor,
        include_directories: bool,
        recursive: bool,
    ) -> anyhow::Result<Vec<String>> {
        let root_str = root.identity();
        let mut paths = vec![];
        let mut pairs = crawl(root, root, include_directories, recursive);
        while let Some(pair) = pairs.next().await {
            let (entry, _) = pair?;
            paths.push(entry.identity()[root_str.len() + 1..].to_string());
        }
        Ok(paths)
    }

    #[tokio::test]
    #[traced_test]
    async fn directories_precede_their_descendants() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let root = Descriptor::new(LocalBackend::new(tmp_dir.join("foo")));
        let paths = relative_paths(&root, true, true).await?;
        assert_eq!(paths.len(), 7);
        for (idx, path) in paths.iter().enumerate() {
            if let Some((parent, _)) = path.rsplit_once('/') {
                let parent_idx = paths.iter().position(|p| p == parent);
                assert!(
                    parent_idx.is_some_and(|parent_idx| parent_idx < idx),
                    "{parent} not yielded before {path}"
                );
            }
        }
        let mut files = relative_paths(&root, false, true).await?;
        files.sort();
        assert_eq!(
            files,
            vec!["0.txt", "bar/1.txt", "bar/2.txt", "bar/3.txt", "baz/4.txt"]
        );
        let mut top = relative_paths(&root, true, false).await?;
        top.sort();
        assert_eq!(top, vec!["0.txt", "bar", "baz"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn mirror_follows_relative_paths() -> anyhow::Result<()> {
        let ctx = Context::with_defaults()?;
        let tmp_dir = testutils::setup_test_dir().await?;
        let root = ctx.resolve(tmp_dir.join("foo").to_str().unwrap_or_default())?;
        let mirror = ctx.resolve("memory://mirror/copy")?;
        let mut pairs = crawl(&root, &mirror, false, true);
        let mut mirrored = vec![];
        while let Some(pair) = pairs.next().await {
            mirrored.push(pair?.1.identity());
        }
        mirrored.sort();
        assert_eq!(
            mirrored,
            vec![
                "memory://mirror/copy/0.txt",
                "memory://mirror/copy/bar/1.txt",
                "memory://mirror/copy/bar/2.txt",
                "memory://mirror/copy/bar/3.txt",
                "memory://mirror/copy/baz/4.txt",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn crawling_a_missing_root_yields_one_error() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let root = Descriptor::new(LocalBackend::new(tmp_dir.join("missing")));
        let results: Vec<_> = crawl(&root, &root, true, true).collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::NotFound(_))));
        Ok(())
    }
}
