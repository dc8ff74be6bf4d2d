//! Ratings and tags. Both always live on the canonical record, so every
//! perceptual duplicate in a cluster shares one rating and one tag set.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::Catalog;
use crate::error::FinderError;

#[derive(Debug, Clone, PartialEq)]
pub struct Rating {
    pub image_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
    pub updated_at: String,
}

impl Catalog {
    /// Rate the cluster `id` belongs to. Returns the canonical id that
    /// received the rating.
    pub fn set_rating(&self, id: i64, rating: i64, comment: Option<&str>) -> Result<i64> {
        if !(1..=5).contains(&rating) {
            return Err(FinderError::InvalidRating(rating).into());
        }
        let canonical = self.canonical_id(id)?;
        self.conn.execute(
            r#"
            INSERT INTO ratings (image_id, rating, comment)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(image_id) DO UPDATE SET
                rating = excluded.rating,
                comment = excluded.comment,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![canonical, rating, comment],
        )?;
        Ok(canonical)
    }

    pub fn get_rating(&self, id: i64) -> Result<Option<Rating>> {
        let canonical = self.canonical_id(id)?;
        let rating = self
            .conn
            .query_row(
                "SELECT image_id, rating, comment, updated_at FROM ratings WHERE image_id = ?",
                [canonical],
                |row| {
                    Ok(Rating {
                        image_id: row.get(0)?,
                        rating: row.get(1)?,
                        comment: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(rating)
    }

    pub fn clear_rating(&self, id: i64) -> Result<bool> {
        let canonical = self.canonical_id(id)?;
        let removed = self
            .conn
            .execute("DELETE FROM ratings WHERE image_id = ?", [canonical])?;
        Ok(removed > 0)
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Create a tag if missing and return its id. Names are trimmed.
    pub fn create_tag(&self, name: &str) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FinderError::EmptyTag.into());
        }
        self.conn
            .execute("INSERT OR IGNORE INTO tags (name) VALUES (?)", [name])?;
        let id = self
            .conn
            .query_row("SELECT id FROM tags WHERE name = ?", [name], |row| row.get(0))?;
        Ok(id)
    }

    /// Attach `name` to the cluster `id` belongs to. Returns false when the
    /// tag was already attached.
    pub fn tag(&self, id: i64, name: &str) -> Result<bool> {
        let canonical = self.canonical_id(id)?;
        let tag_id = self.create_tag(name)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO image_tags (image_id, tag_id) VALUES (?, ?)",
            params![canonical, tag_id],
        )?;
        Ok(inserted > 0)
    }

    pub fn untag(&self, id: i64, name: &str) -> Result<bool> {
        let canonical = self.canonical_id(id)?;
        let removed = self.conn.execute(
            r#"
            DELETE FROM image_tags
            WHERE image_id = ?1
              AND tag_id = (SELECT id FROM tags WHERE name = ?2)
            "#,
            params![canonical, name.trim()],
        )?;
        Ok(removed > 0)
    }

    pub fn tags(&self, id: i64) -> Result<Vec<String>> {
        let canonical = self.canonical_id(id)?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.name FROM tags t
            JOIN image_tags it ON it.tag_id = t.id
            WHERE it.image_id = ?
            ORDER BY t.name
            "#,
        )?;
        let names = stmt
            .query_map([canonical], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Drop tags no image uses any more.
    pub fn delete_unused_tags(&self) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM image_tags)",
            [],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::error::FinderError;

    #[test]
    fn test_rating_resolves_to_canonical() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();
        catalog.replace_duplicate_assignments(&[(b, a)]).unwrap();

        assert_eq!(catalog.set_rating(b, 4, Some("nice")).unwrap(), a);
        let rating = catalog.get_rating(a).unwrap().unwrap();
        assert_eq!(rating.image_id, a);
        assert_eq!(rating.rating, 4);
        assert_eq!(catalog.get_rating(b).unwrap(), Some(rating));

        assert!(catalog.clear_rating(b).unwrap());
        assert!(catalog.get_rating(a).unwrap().is_none());
    }

    #[test]
    fn test_rating_bounds() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        for bad in [0, 6, -1] {
            let err = catalog.set_rating(a, bad, None).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<FinderError>(),
                Some(FinderError::InvalidRating(_))
            ));
        }
        assert!(catalog.set_rating(a, 5, None).is_ok());
    }

    #[test]
    fn test_tags_are_shared_by_duplicates() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();
        catalog.replace_duplicate_assignments(&[(b, a)]).unwrap();

        assert!(catalog.tag(b, "  beach ").unwrap());
        assert!(!catalog.tag(a, "beach").unwrap());
        catalog.tag(a, "sunset").unwrap();
        assert_eq!(catalog.tags(b).unwrap(), vec!["beach", "sunset"]);

        assert!(catalog.untag(b, "sunset").unwrap());
        assert_eq!(catalog.tags(a).unwrap(), vec!["beach"]);
        assert_eq!(catalog.delete_unused_tags().unwrap(), 1);
    }

    #[test]
    fn test_empty_tag_rejected() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let err = catalog.tag(a, "   ").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinderError>(),
            Some(FinderError::EmptyTag)
        ));
    }
}
