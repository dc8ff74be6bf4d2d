pub const SCHEMA: &str = r#"
-- Images table: one row per catalogued file
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL UNIQUE,
    file_name TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    format TEXT,
    thumbnail_path TEXT,

    -- Slot in the embedding store, set once the vector is merged
    embedding_index INTEGER,

    -- Fingerprints
    perceptual_hash TEXT,
    content_hash TEXT,

    -- Duplicate relation (forest of depth 1)
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    duplicate_of INTEGER REFERENCES images(id),

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_images_embedding_index
    ON images(embedding_index) WHERE embedding_index IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_images_perceptual ON images(perceptual_hash);
CREATE INDEX IF NOT EXISTS idx_images_content ON images(content_hash);
CREATE INDEX IF NOT EXISTS idx_images_duplicate_of ON images(duplicate_of);

-- Ratings attach to canonical records only
CREATE TABLE IF NOT EXISTS ratings (
    image_id INTEGER PRIMARY KEY REFERENCES images(id) ON DELETE CASCADE,
    rating INTEGER NOT NULL CHECK (rating >= 1 AND rating <= 5),
    comment TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS image_tags (
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (image_id, tag_id)
);

-- Job checkpoints for resumable runs
CREATE TABLE IF NOT EXISTS processing_status (
    job_name TEXT PRIMARY KEY,
    total INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    marker TEXT,
    started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    completed_at TEXT
);

-- Files that could not be registered or embedded
CREATE TABLE IF NOT EXISTS failed_images (
    file_path TEXT PRIMARY KEY,
    error_message TEXT NOT NULL,
    failed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Next free embedding slot
CREATE TABLE IF NOT EXISTS slot_allocator (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    next_slot INTEGER NOT NULL
);
"#;
