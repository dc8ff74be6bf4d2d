//! Persistence of the duplicate relation and canonical id resolution.

use anyhow::Result;
use rusqlite::params;
use std::collections::BTreeMap;

use super::Catalog;
use crate::error::FinderError;

impl Catalog {
    /// `duplicate_of` if set, otherwise `id` itself.
    pub fn canonical_id(&self, id: i64) -> Result<i64> {
        let result = self.conn.query_row(
            "SELECT COALESCE(duplicate_of, id) FROM images WHERE id = ?",
            [id],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(canonical) => Ok(canonical),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(FinderError::RecordNotFound(id).into()),
            Err(e) => Err(e.into()),
        }
    }

    /// `(id, perceptual hash)` for every record that has one.
    pub fn hashed_records(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, perceptual_hash FROM images
            WHERE perceptual_hash IS NOT NULL AND perceptual_hash != ''
            ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Replace the whole duplicate relation with `assignments`, given as
    /// `(duplicate id, canonical id)` pairs.
    ///
    /// Prior flags are cleared first, so applying the same assignments twice
    /// leaves the same state. Ratings and tags that sit on a record which is
    /// now a duplicate move to its canonical record; on a rating conflict the
    /// most recently updated one wins.
    pub fn replace_duplicate_assignments(&self, assignments: &[(i64, i64)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
            UPDATE images SET is_duplicate = 0, duplicate_of = NULL
            WHERE is_duplicate != 0 OR duplicate_of IS NOT NULL
            "#,
            [],
        )?;

        {
            let mut mark = tx.prepare(
                r#"
                UPDATE images
                SET is_duplicate = 1, duplicate_of = ?2, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?1
                "#,
            )?;
            let mut move_rating = tx.prepare(
                r#"
                INSERT INTO ratings (image_id, rating, comment, created_at, updated_at)
                SELECT ?2, rating, comment, created_at, updated_at FROM ratings WHERE image_id = ?1
                ON CONFLICT(image_id) DO UPDATE SET
                    rating = excluded.rating,
                    comment = excluded.comment,
                    updated_at = excluded.updated_at
                WHERE excluded.updated_at > ratings.updated_at
                "#,
            )?;
            let mut drop_rating = tx.prepare("DELETE FROM ratings WHERE image_id = ?")?;
            let mut move_tags = tx.prepare(
                r#"
                INSERT OR IGNORE INTO image_tags (image_id, tag_id, created_at)
                SELECT ?2, tag_id, created_at FROM image_tags WHERE image_id = ?1
                "#,
            )?;
            let mut drop_tags = tx.prepare("DELETE FROM image_tags WHERE image_id = ?")?;

            for &(duplicate, canonical) in assignments {
                if mark.execute(params![duplicate, canonical])? == 0 {
                    return Err(FinderError::RecordNotFound(duplicate).into());
                }
                move_rating.execute(params![duplicate, canonical])?;
                drop_rating.execute([duplicate])?;
                move_tags.execute(params![duplicate, canonical])?;
                drop_tags.execute([duplicate])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Duplicate ids grouped under their canonical id.
    pub fn duplicate_groups(&self) -> Result<BTreeMap<i64, Vec<i64>>> {
        let mut stmt = self.conn.prepare(
            "SELECT duplicate_of, id FROM images WHERE duplicate_of IS NOT NULL ORDER BY duplicate_of, id",
        )?;
        let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (canonical, id) = row?;
            groups.entry(canonical).or_default().push(id);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::error::FinderError;

    #[test]
    fn test_canonical_id_is_idempotent() {
        let (_dir, catalog) = open_temp();
        let ids: Vec<i64> = (0..4)
            .map(|i| catalog.register(&new_image(&format!("/{i}.png"), None)).unwrap())
            .collect();
        catalog
            .replace_duplicate_assignments(&[(ids[1], ids[0]), (ids[2], ids[0])])
            .unwrap();

        for &id in &ids {
            let canonical = catalog.canonical_id(id).unwrap();
            assert_eq!(catalog.canonical_id(canonical).unwrap(), canonical);
        }
        assert_eq!(catalog.canonical_id(ids[2]).unwrap(), ids[0]);
        assert_eq!(catalog.canonical_id(ids[3]).unwrap(), ids[3]);

        let err = catalog.canonical_id(999).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinderError>(),
            Some(FinderError::RecordNotFound(999))
        ));
    }

    #[test]
    fn test_replace_clears_previous_relation() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();
        let c = catalog.register(&new_image("/c.png", None)).unwrap();

        catalog.replace_duplicate_assignments(&[(b, a), (c, a)]).unwrap();
        catalog.replace_duplicate_assignments(&[(c, b)]).unwrap();

        let a_rec = catalog.get_record(a).unwrap().unwrap();
        assert!(!a_rec.is_duplicate);
        let b_rec = catalog.get_record(b).unwrap().unwrap();
        assert!(!b_rec.is_duplicate);
        assert_eq!(b_rec.duplicate_of, None);
        let c_rec = catalog.get_record(c).unwrap().unwrap();
        assert!(c_rec.is_duplicate);
        assert_eq!(c_rec.duplicate_of, Some(b));

        let groups = catalog.duplicate_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&b], vec![c]);
    }

    #[test]
    fn test_annotations_move_to_canonical() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", None)).unwrap();
        let b = catalog.register(&new_image("/b.png", None)).unwrap();

        // Rated and tagged while still independent
        catalog.set_rating(b, 3, None).unwrap();
        catalog.tag(b, "cats").unwrap();

        catalog.replace_duplicate_assignments(&[(b, a)]).unwrap();

        let rating = catalog.get_rating(a).unwrap().unwrap();
        assert_eq!(rating.image_id, a);
        assert_eq!(rating.rating, 3);
        assert_eq!(catalog.tags(a).unwrap(), vec!["cats"]);
    }

    #[test]
    fn test_hashed_records_skips_missing() {
        let (_dir, catalog) = open_temp();
        let a = catalog.register(&new_image("/a.png", Some("ffff000000000000"))).unwrap();
        catalog.register(&new_image("/b.png", None)).unwrap();
        assert_eq!(
            catalog.hashed_records().unwrap(),
            vec![(a, "ffff000000000000".to_string())]
        );
    }
}
