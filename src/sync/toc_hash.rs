//! 目录指纹：判断书源结构是否变化，决定缓存是否可信。

use sha2::{Digest, Sha256};

use super::models::ChapterRef;

/// 对 (index, url, title, is_volume) 序列做规范化 JSON 序列化后取 SHA-256。
pub fn toc_hash(chapters: &[ChapterRef]) -> String {
    let canonical: Vec<(usize, &str, &str, bool)> = chapters
        .iter()
        .map(|c| (c.index, c.url.as_str(), c.title.as_str(), c.is_volume))
        .collect();
    // 元组序列化不会失败；保险起见失败时退回空输入
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toc(n: usize) -> Vec<ChapterRef> {
        (1..=n)
            .map(|i| ChapterRef {
                index: i,
                url: format!("https://example.org/c/{i}"),
                title: format!("第{i}章"),
                is_volume: false,
            })
            .collect()
    }

    #[test]
    fn same_list_same_digest() {
        assert_eq!(toc_hash(&toc(12)), toc_hash(&toc(12)));
        assert_eq!(toc_hash(&toc(3)).len(), 64);
    }

    #[test]
    fn title_change_changes_digest() {
        let a = toc(5);
        let mut b = toc(5);
        b[2].title.push('!');
        assert_ne!(toc_hash(&a), toc_hash(&b));
    }

    #[test]
    fn reorder_insert_remove_and_volume_flag_change_digest() {
        let base = toc(5);
        let h = toc_hash(&base);

        let mut reordered = base.clone();
        reordered.swap(0, 1);
        assert_ne!(h, toc_hash(&reordered));

        let mut removed = base.clone();
        removed.pop();
        assert_ne!(h, toc_hash(&removed));

        let mut inserted = base.clone();
        inserted.insert(
            2,
            ChapterRef {
                index: 99,
                url: String::new(),
                title: "番外".to_string(),
                is_volume: false,
            },
        );
        assert_ne!(h, toc_hash(&inserted));

        let mut flagged = base;
        flagged[0].is_volume = true;
        assert_ne!(h, toc_hash(&flagged));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = vec![ChapterRef {
            index: 1,
            url: "ab".to_string(),
            title: "c".to_string(),
            is_volume: false,
        }];
        let b = vec![ChapterRef {
            index: 1,
            url: "a".to_string(),
            title: "bc".to_string(),
            is_volume: false,
        }];
        assert_ne!(toc_hash(&a), toc_hash(&b));
    }
}
