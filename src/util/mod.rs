pub mod cryptoutil;
