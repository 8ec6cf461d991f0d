pub mod release_date;
